//! # Configuration System
//!
//! Configuration for the permissions sync service.
//!
//! This crate provides:
//! - Configuration structures for every subsystem
//! - Configuration file loading (TOML/YAML)
//! - Environment variable overrides (12-factor app principles)
//! - Configuration validation
//!
//! Precedence is env > file > defaults.
//!
//! # Best Practices
//!
//! - Uses `validator` crate for input validation
//! - Follows 12-factor app configuration principles
//! - Provides clear error messages for invalid configuration

pub mod config;
pub mod file_loader;
pub mod loader;

pub use config::{
    ApiConfig, CodeHostConfig, DatabaseConfig, ObservabilityConfig, PermsSyncConfig,
    SchedulerConfig, SyncerConfig, WorkerConfig
};
pub use file_loader::{ConfigFileError, load_from_file, load_from_toml, load_from_yaml};
pub use loader::{ConfigError, apply_env_overrides, load};
pub use validator::Validate;

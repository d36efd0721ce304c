//! # Environment Variable Loader
//!
//! Applies `PS_*` environment variables on top of a file or default
//! configuration, then validates the result.
//!
//! # Naming Convention
//! - `PS_CONFIG`: Path of the TOML/YAML configuration file
//! - `PS_DATABASE_*`: PostgreSQL settings
//! - `PS_SYNCER_*`: Orchestrator settings
//! - `PS_SCHEDULER_*`: Periodic resync settings
//! - `PS_WORKER_*`: Durable job worker settings
//! - `PS_API_*`: Schedule API settings
//! - `PS_METRICS_*`, `PS_LOG_LEVEL`: Observability settings

use crate::config::PermsSyncConfig;
use crate::file_loader::{ConfigFileError, load_from_file};
use std::env;
use std::path::Path;
use validator::Validate;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    File(#[from] ConfigFileError),

    #[error("Invalid value for {key}: {reason}")]
    Env { key: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors)
}

/// Load the complete configuration.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Resolves configuration in precedence order: defaults, then the file named
/// by `path` (or `PS_CONFIG` when `path` is `None`), then `PS_*` environment
/// variables. The merged result is validated before it is returned.
///
/// ## Usage
/// ```rust,no_run
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = config::load(None)?;
///     println!("API port: {}", config.api.port);
///     Ok(())
/// }
/// ```
pub fn load(path: Option<&Path>) -> Result<PermsSyncConfig, ConfigError> {
    let from_env_path = env::var("PS_CONFIG").ok();
    let path = path.or(from_env_path.as_deref().map(Path::new));

    let mut config = match path {
        Some(path) => load_from_file(path)?,
        None => PermsSyncConfig::default()
    };
    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

/// Override configuration values from environment variables.
///
/// ## Environment Variables
/// - `PS_ALLOW_ACCESS_BY_DEFAULT`: true/false
/// - `PS_DATABASE_ENABLED`: Use PostgreSQL (true/false)
/// - `PS_DATABASE_URL`: Full connection URL
/// - `PS_DATABASE_HOST`, `PS_DATABASE_PORT`, `PS_DATABASE_NAME`,
///   `PS_DATABASE_USERNAME`, `PS_DATABASE_PASSWORD`, `PS_DATABASE_POOL_SIZE`
/// - `PS_SYNCER_USER_CONCURRENCY`, `PS_SYNCER_REPO_CONCURRENCY`,
///   `PS_SYNCER_POLL_INTERVAL_MS`, `PS_SYNCER_RATE_LIMIT_PER_SECOND`,
///   `PS_SYNCER_REQUEST_TIMEOUT_SECONDS`
/// - `PS_SCHEDULER_ENABLED`, `PS_SCHEDULER_INTERVAL_SECONDS`,
///   `PS_SCHEDULER_SYNC_OLDEST_USERS`, `PS_SCHEDULER_SYNC_OLDEST_REPOS`,
///   `PS_SCHEDULER_MIN_STALE_AGE_SECONDS`
/// - `PS_WORKER_ENABLED`, `PS_WORKER_POLL_INTERVAL_MS`,
///   `PS_WORKER_NUM_HANDLERS`, `PS_WORKER_RESET_INTERVAL_SECONDS`,
///   `PS_WORKER_STALL_AFTER_SECONDS`, `PS_WORKER_MAX_NUM_RESETS`
/// - `PS_API_ENABLED`, `PS_API_HOST`, `PS_API_PORT`
/// - `PS_METRICS_ENABLED`, `PS_METRICS_PORT`, `PS_LOG_LEVEL`
pub fn apply_env_overrides(config: &mut PermsSyncConfig) -> Result<(), ConfigError> {
    override_with(&mut config.allow_access_by_default, "PS_ALLOW_ACCESS_BY_DEFAULT")?;

    let db = &mut config.database;
    override_with(&mut db.enabled, "PS_DATABASE_ENABLED")?;
    if let Ok(url) = env::var("PS_DATABASE_URL") {
        db.url = Some(url);
    }
    override_with(&mut db.host, "PS_DATABASE_HOST")?;
    override_with(&mut db.port, "PS_DATABASE_PORT")?;
    override_with(&mut db.database, "PS_DATABASE_NAME")?;
    override_with(&mut db.username, "PS_DATABASE_USERNAME")?;
    override_with(&mut db.password, "PS_DATABASE_PASSWORD")?;
    override_with(&mut db.pool_size, "PS_DATABASE_POOL_SIZE")?;

    let syncer = &mut config.syncer;
    override_with(&mut syncer.user_sync_concurrency, "PS_SYNCER_USER_CONCURRENCY")?;
    override_with(&mut syncer.repo_sync_concurrency, "PS_SYNCER_REPO_CONCURRENCY")?;
    override_with(&mut syncer.poll_interval_ms, "PS_SYNCER_POLL_INTERVAL_MS")?;
    override_with(&mut syncer.rate_limit_per_second, "PS_SYNCER_RATE_LIMIT_PER_SECOND")?;
    override_with(&mut syncer.request_timeout_seconds, "PS_SYNCER_REQUEST_TIMEOUT_SECONDS")?;

    let scheduler = &mut config.scheduler;
    override_with(&mut scheduler.enabled, "PS_SCHEDULER_ENABLED")?;
    override_with(&mut scheduler.interval_seconds, "PS_SCHEDULER_INTERVAL_SECONDS")?;
    override_with(&mut scheduler.sync_oldest_users, "PS_SCHEDULER_SYNC_OLDEST_USERS")?;
    override_with(&mut scheduler.sync_oldest_repos, "PS_SCHEDULER_SYNC_OLDEST_REPOS")?;
    override_with(&mut scheduler.min_stale_age_seconds, "PS_SCHEDULER_MIN_STALE_AGE_SECONDS")?;

    let worker = &mut config.worker;
    override_with(&mut worker.enabled, "PS_WORKER_ENABLED")?;
    override_with(&mut worker.poll_interval_ms, "PS_WORKER_POLL_INTERVAL_MS")?;
    override_with(&mut worker.num_handlers, "PS_WORKER_NUM_HANDLERS")?;
    override_with(&mut worker.reset_interval_seconds, "PS_WORKER_RESET_INTERVAL_SECONDS")?;
    override_with(&mut worker.stall_after_seconds, "PS_WORKER_STALL_AFTER_SECONDS")?;
    override_with(&mut worker.max_num_resets, "PS_WORKER_MAX_NUM_RESETS")?;

    let api = &mut config.api;
    override_with(&mut api.enabled, "PS_API_ENABLED")?;
    override_with(&mut api.host, "PS_API_HOST")?;
    override_with(&mut api.port, "PS_API_PORT")?;

    let observability = &mut config.observability;
    override_with(&mut observability.metrics_enabled, "PS_METRICS_ENABLED")?;
    override_with(&mut observability.metrics_port, "PS_METRICS_PORT")?;
    override_with(&mut observability.logging_level, "PS_LOG_LEVEL")?;

    Ok(())
}

/// Replaces `target` when `key` is set. Unset variables leave it unchanged;
/// unparsable values are errors.
fn override_with<T>(target: &mut T, key: &str) -> Result<(), ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display
{
    match parse_env(key) {
        Some(Ok(value)) => {
            *target = value;
            Ok(())
        }
        Some(Err(reason)) => Err(ConfigError::Env {
            key: key.to_string(),
            reason
        }),
        None => Ok(())
    }
}

fn parse_env<T>(key: &str) -> Option<Result<T, String>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display
{
    env::var(key)
        .ok()
        .map(|s| s.trim().parse::<T>().map_err(|e| e.to_string()))
}

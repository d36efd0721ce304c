//! # Authorization Core
//!
//! Shared types and traits for the permissions sync engine.
//!
//! This crate provides:
//! - Permission records for users, repositories and pending external accounts
//! - The result shape returned by code-host providers
//! - The `Provider` trait implemented once per code host
//! - Provider lookup by URN and the swappable provider registry
//!
//! # Best Practices
//!
//! - Follows Microsoft Pragmatic Rust Guidelines
//! - Uses Rust Edition 2024 (never back)
//! - Provider errors come from the `errors` crate

pub mod providers;
pub mod traits;
pub mod types;

pub use providers::{AuthzSnapshot, ProviderRegistry, ProviderSet, ProviderSource};
pub use traits::Provider;
pub use types::{
    Account, AccountData, AccountSpec, Accounts, CodeHostState, CodeHostStatus,
    CodeHostStatusesSet, ExternalRepoSpec, ExternalUserPermissions, FetchPermsOptions, PermType,
    Perms, Repo, RepoId, RepoPermissions, ServiceKind, SubRepoPermissions, User, UserId,
    UserPendingPermissions, UserPermissions
};

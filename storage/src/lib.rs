//! # Storage Layer
//!
//! Persistence for permissions, external accounts and durable sync jobs.
//! Every store is a trait so the syncer can run against PostgreSQL in
//! production and the in-memory implementation in tests.

pub mod error;
pub mod jobs;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use jobs::{NewSyncJob, PermissionSyncJob, SyncJobPriority, SyncJobState};
pub use memory::{Clock, MemoryStore, MemoryTransaction};
pub use postgres::{PostgresStore, PostgresTransaction};
pub use traits::{
    ExternalAccountStore, ExternalAccountsListOptions, PermsDiff, PermsOps, PermsStore,
    PermsTransaction, RepoListOptions, RepoStore, SyncJobStore, UserStore,
};

//! # Permissions Syncer
//!
//! Keeps the local permissions store in line with what external code hosts
//! say users and repositories can access.
//!
//! This crate provides:
//! - A deduplicated priority queue of sync requests
//! - The `PermsSyncer` orchestrator with per-type concurrency pools
//! - A periodic scheduler for never-synced and stale permissions
//! - A worker adapter for durable, database-backed sync jobs
//! - GitHub and GitLab authorization providers
//! - An HTTP API for ad hoc sync requests

pub mod api;
pub mod client;
pub mod error;
pub mod github;
pub mod gitlab;
pub mod providers;
pub mod queue;
pub mod rate_limit;
pub mod scheduler;
pub mod service;
pub mod sync_repo;
pub mod sync_user;
pub mod syncer;
pub mod telemetry;
pub mod worker;

pub use api::{ApiServer, create_router};
pub use error::{PermsSyncError, PermsSyncResult};
pub use github::GitHubProvider;
pub use gitlab::GitLabProvider;
pub use providers::{ProviderBuild, build_providers, rate_limiters_for, validate_connections};
pub use queue::{Priority, RequestMeta, RequestQueue, RequestType, SyncRequest};
pub use rate_limit::{ApiRateLimiter, RateLimiterRegistry};
pub use scheduler::{PermsScheduler, ScheduleReport, schedule_once};
pub use syncer::{PermsSyncer, Stores, SyncOutcome};
pub use worker::{JobHandler, Resetter, SyncJobHandler, Worker, WorkerOptions, request_from_job};

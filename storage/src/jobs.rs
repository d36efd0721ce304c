//! Durable permission sync jobs, as stored by [`crate::SyncJobStore`].

use authz::{CodeHostStatusesSet, RepoId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, EnumString,
    Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SyncJobPriority {
    Low,
    Medium,
    High,
}

impl SyncJobPriority {
    /// Numeric weight persisted in the `priority` column; higher runs first.
    pub fn weight(&self) -> i32 {
        match self {
            Self::Low => 0,
            Self::Medium => 5,
            Self::High => 10,
        }
    }

    pub fn from_weight(weight: i32) -> Self {
        match weight {
            w if w >= 10 => Self::High,
            w if w >= 5 => Self::Medium,
            _ => Self::Low,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SyncJobState {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// A persisted request to sync one user or one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionSyncJob {
    pub id: i64,
    pub state: SyncJobState,
    pub user_id: Option<UserId>,
    pub repository_id: Option<RepoId>,
    pub priority: SyncJobPriority,
    pub invalidate_caches: bool,
    pub reason: Option<String>,
    pub failure_message: Option<String>,
    pub num_resets: i32,
    pub num_failures: i32,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub worker_hostname: Option<String>,
    pub code_host_states: Option<CodeHostStatusesSet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSyncJob {
    pub user_id: Option<UserId>,
    pub repository_id: Option<RepoId>,
    pub priority: SyncJobPriority,
    pub invalidate_caches: bool,
    pub reason: Option<String>,
}

impl NewSyncJob {
    pub fn user(user_id: UserId, priority: SyncJobPriority) -> Self {
        Self {
            user_id: Some(user_id),
            repository_id: None,
            priority,
            invalidate_caches: false,
            reason: None,
        }
    }

    pub fn repo(repo_id: RepoId, priority: SyncJobPriority) -> Self {
        Self {
            user_id: None,
            repository_id: Some(repo_id),
            priority,
            invalidate_caches: false,
            reason: None,
        }
    }

    pub fn with_invalidate_caches(mut self, invalidate_caches: bool) -> Self {
        self.invalidate_caches = invalidate_caches;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Exactly one of user and repository must be set.
    pub fn is_valid(&self) -> bool {
        self.user_id.is_some() != self.repository_id.is_some()
    }
}

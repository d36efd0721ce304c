//! Store contracts consumed by the permissions syncer.

use crate::error::StoreResult;
use crate::jobs::{NewSyncJob, PermissionSyncJob};
use async_trait::async_trait;
use authz::{
    Account, AccountSpec, Accounts, CodeHostStatusesSet, ExternalRepoSpec, Repo, RepoId,
    RepoPermissions, SubRepoPermissions, User, UserId, UserPendingPermissions, UserPermissions,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// Result of a full-replace permissions write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PermsDiff {
    pub added: usize,
    pub removed: usize,
    /// Number of IDs in the stored set after the write.
    pub found: usize,
}

impl PermsDiff {
    pub fn is_unchanged(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

/// Permission reads and writes. Every `set_*` is a full replacement that keeps
/// the user-centric and repo-centric views consistent with each other.
#[async_trait]
pub trait PermsOps: Send + Sync {
    async fn load_user_permissions(&self, user_id: UserId)
    -> StoreResult<Option<UserPermissions>>;

    async fn load_repo_permissions(&self, repo_id: RepoId)
    -> StoreResult<Option<RepoPermissions>>;

    async fn set_user_permissions(&self, perms: &UserPermissions) -> StoreResult<PermsDiff>;

    async fn set_repo_permissions(&self, perms: &RepoPermissions) -> StoreResult<PermsDiff>;

    /// Refreshes the sync timestamps without changing the stored set. Creates
    /// an empty row when none exists.
    async fn touch_user_permissions(&self, user_id: UserId) -> StoreResult<()>;

    async fn touch_repo_permissions(&self, repo_id: RepoId) -> StoreResult<()>;

    /// Records that the given code-host accounts, not yet linked to any local
    /// user, can read the repository.
    async fn set_repo_pending_permissions(
        &self,
        accounts: &Accounts,
        perms: &RepoPermissions,
    ) -> StoreResult<()>;

    async fn load_user_pending_permissions(
        &self,
        spec: &AccountSpec,
    ) -> StoreResult<Option<UserPendingPermissions>>;

    /// Moves pending grants of the account into the user's permissions.
    /// Returns the number of repositories granted.
    async fn grant_pending_permissions(
        &self,
        user_id: UserId,
        spec: &AccountSpec,
    ) -> StoreResult<usize>;

    async fn set_sub_repo_permissions(
        &self,
        user_id: UserId,
        repo_id: RepoId,
        perms: &SubRepoPermissions,
    ) -> StoreResult<()>;

    async fn load_sub_repo_permissions(
        &self,
        user_id: UserId,
        repo_id: RepoId,
    ) -> StoreResult<Option<SubRepoPermissions>>;

    /// Deletes the user's sub-repo rules for repositories not in `keep`.
    /// Returns the number of rows deleted.
    async fn retain_sub_repo_permissions(
        &self,
        user_id: UserId,
        keep: &[RepoId],
    ) -> StoreResult<usize>;

    /// Maps account IDs to the local users they belong to. Accounts without a
    /// user are absent from the result.
    async fn get_user_ids_by_external_accounts(
        &self,
        accounts: &Accounts,
    ) -> StoreResult<HashMap<String, UserId>>;

    async fn user_ids_with_no_perms(&self) -> StoreResult<Vec<UserId>>;

    /// Private repositories that have never been synced.
    async fn repo_ids_with_no_perms(&self) -> StoreResult<Vec<RepoId>>;

    async fn user_ids_with_oldest_perms(
        &self,
        limit: usize,
        age: Duration,
    ) -> StoreResult<HashMap<UserId, DateTime<Utc>>>;

    async fn repo_ids_with_oldest_perms(
        &self,
        limit: usize,
        age: Duration,
    ) -> StoreResult<HashMap<RepoId, DateTime<Utc>>>;

    async fn delete_all_user_permissions(&self, user_id: UserId) -> StoreResult<()>;
}

#[async_trait]
pub trait PermsStore: PermsOps {
    /// Opens a transaction. Writes made through the returned handle become
    /// visible only after [`PermsTransaction::commit`]; dropping the handle
    /// rolls them back.
    async fn transact(&self) -> StoreResult<Box<dyn PermsTransaction>>;
}

#[async_trait]
pub trait PermsTransaction: PermsOps {
    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_by_id(&self, id: UserId) -> StoreResult<Option<User>>;

    async fn list(&self, ids: &[UserId]) -> StoreResult<Vec<User>>;

    async fn verified_emails(&self, id: UserId) -> StoreResult<Vec<String>>;
}

#[derive(Debug, Clone, Default)]
pub struct RepoListOptions {
    pub ids: Vec<RepoId>,
    pub only_private: bool,
    /// Match repositories by exact external ID on the given code host.
    pub external_repos: Vec<ExternalRepoSpec>,
    /// Match repositories whose external ID starts with the spec ID.
    pub external_repo_include_contains: Vec<ExternalRepoSpec>,
    /// Drop repositories whose external ID starts with the spec ID.
    pub external_repo_exclude_contains: Vec<ExternalRepoSpec>,
}

#[async_trait]
pub trait RepoStore: Send + Sync {
    async fn get_by_id(&self, id: RepoId) -> StoreResult<Option<Repo>>;

    async fn list(&self, opts: &RepoListOptions) -> StoreResult<Vec<Repo>>;
}

#[derive(Debug, Clone, Default)]
pub struct ExternalAccountsListOptions {
    pub user_id: Option<UserId>,
    pub service_type: Option<String>,
    pub service_id: Option<String>,
    pub account_ids: Vec<String>,
    pub exclude_expired: bool,
    pub only_expired: bool,
}

#[async_trait]
pub trait ExternalAccountStore: Send + Sync {
    async fn list(&self, opts: &ExternalAccountsListOptions) -> StoreResult<Vec<Account>>;

    /// Inserts the account or updates the row with the same spec. Returns the
    /// stored account.
    async fn upsert(&self, account: &Account) -> StoreResult<Account>;

    async fn touch_expired(&self, id: i64) -> StoreResult<()>;

    async fn touch_last_valid(&self, id: i64) -> StoreResult<()>;
}

/// Durable job queue polled by the worker adapter.
#[async_trait]
pub trait SyncJobStore: Send + Sync {
    async fn create(&self, job: &NewSyncJob) -> StoreResult<i64>;

    async fn get(&self, id: i64) -> StoreResult<Option<PermissionSyncJob>>;

    /// Claims the most urgent queued job, moving it to `processing`.
    async fn dequeue(&self, worker_hostname: &str) -> StoreResult<Option<PermissionSyncJob>>;

    async fn heartbeat(&self, ids: &[i64]) -> StoreResult<()>;

    async fn mark_complete(&self, id: i64, statuses: &CodeHostStatusesSet) -> StoreResult<()>;

    async fn mark_failed(
        &self,
        id: i64,
        message: &str,
        statuses: &CodeHostStatusesSet,
    ) -> StoreResult<()>;

    /// Requeues processing jobs whose heartbeat is older than `stall_after`.
    /// Jobs already reset `max_resets` times are failed instead. Returns the
    /// `(reset, failed)` job IDs.
    async fn reset_stalled(
        &self,
        stall_after: Duration,
        max_resets: i32,
    ) -> StoreResult<(Vec<i64>, Vec<i64>)>;
}

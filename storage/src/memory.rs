//! In-memory implementation of every store trait.
//!
//! Used by tests and by the syncer when no database is configured. A
//! transaction works on a private copy of the permissions state while
//! holding the store lock, and swaps the copy in on commit.

use crate::error::{StoreError, StoreResult};
use crate::jobs::{NewSyncJob, PermissionSyncJob, SyncJobState};
use crate::traits::{
    ExternalAccountStore, ExternalAccountsListOptions, PermsDiff, PermsOps, PermsStore,
    PermsTransaction, RepoListOptions, RepoStore, SyncJobStore, UserStore,
};
use async_trait::async_trait;
use authz::{
    Account, AccountSpec, Accounts, CodeHostStatusesSet, PermType, Repo, RepoId,
    RepoPermissions, SubRepoPermissions, User, UserId, UserPendingPermissions, UserPermissions,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

type PendingKey = (String, String, String);

#[derive(Debug, Clone, Default)]
pub struct PermsState {
    user_perms: HashMap<UserId, UserPermissions>,
    repo_perms: HashMap<RepoId, RepoPermissions>,
    pending: HashMap<i64, UserPendingPermissions>,
    pending_index: HashMap<PendingKey, i64>,
    repo_pending: HashMap<RepoId, BTreeSet<i64>>,
    sub_repo: HashMap<(UserId, RepoId), SubRepoPermissions>,
    next_pending_id: i64,
}

impl PermsState {
    fn set_user_permissions(&mut self, perms: &UserPermissions, now: DateTime<Utc>) -> PermsDiff {
        let old = self
            .user_perms
            .get(&perms.user_id)
            .map(|p| p.ids.clone())
            .unwrap_or_default();
        let added: Vec<RepoId> = perms.ids.difference(&old).copied().collect();
        let removed: Vec<RepoId> = old.difference(&perms.ids).copied().collect();

        for repo_id in &added {
            let row = self
                .repo_perms
                .entry(*repo_id)
                .or_insert_with(|| RepoPermissions::new(*repo_id, []));
            row.user_ids.insert(perms.user_id);
            row.updated_at = Some(now);
        }
        for repo_id in &removed {
            if let Some(row) = self.repo_perms.get_mut(repo_id) {
                row.user_ids.remove(&perms.user_id);
                row.updated_at = Some(now);
            }
        }

        let mut stored = perms.clone();
        stored.updated_at = Some(now);
        stored.synced_at = Some(now);
        self.user_perms.insert(perms.user_id, stored);

        PermsDiff {
            added: added.len(),
            removed: removed.len(),
            found: perms.ids.len(),
        }
    }

    fn set_repo_permissions(&mut self, perms: &RepoPermissions, now: DateTime<Utc>) -> PermsDiff {
        let old = self
            .repo_perms
            .get(&perms.repo_id)
            .map(|p| p.user_ids.clone())
            .unwrap_or_default();
        let added: Vec<UserId> = perms.user_ids.difference(&old).copied().collect();
        let removed: Vec<UserId> = old.difference(&perms.user_ids).copied().collect();

        for user_id in &added {
            let row = self
                .user_perms
                .entry(*user_id)
                .or_insert_with(|| UserPermissions::new(*user_id, []));
            row.ids.insert(perms.repo_id);
            row.updated_at = Some(now);
        }
        for user_id in &removed {
            if let Some(row) = self.user_perms.get_mut(user_id) {
                row.ids.remove(&perms.repo_id);
                row.updated_at = Some(now);
            }
        }

        let mut stored = perms.clone();
        stored.updated_at = Some(now);
        stored.synced_at = Some(now);
        self.repo_perms.insert(perms.repo_id, stored);

        PermsDiff {
            added: added.len(),
            removed: removed.len(),
            found: perms.user_ids.len(),
        }
    }

    fn touch_user(&mut self, user_id: UserId, now: DateTime<Utc>) {
        let row = self
            .user_perms
            .entry(user_id)
            .or_insert_with(|| UserPermissions::new(user_id, []));
        row.updated_at = Some(now);
        row.synced_at = Some(now);
    }

    fn touch_repo(&mut self, repo_id: RepoId, now: DateTime<Utc>) {
        let row = self
            .repo_perms
            .entry(repo_id)
            .or_insert_with(|| RepoPermissions::new(repo_id, []));
        row.updated_at = Some(now);
        row.synced_at = Some(now);
    }

    fn set_repo_pending_permissions(
        &mut self,
        accounts: &Accounts,
        perms: &RepoPermissions,
        now: DateTime<Utc>,
    ) {
        let mut pending_ids = BTreeSet::new();
        for account_id in &accounts.account_ids {
            let key = (
                accounts.service_type.clone(),
                accounts.service_id.clone(),
                account_id.clone(),
            );
            let id = match self.pending_index.get(&key) {
                Some(id) => *id,
                None => {
                    self.next_pending_id += 1;
                    let id = self.next_pending_id;
                    self.pending.insert(
                        id,
                        UserPendingPermissions {
                            id,
                            service_type: accounts.service_type.clone(),
                            service_id: accounts.service_id.clone(),
                            bind_id: account_id.clone(),
                            perm: perms.perm,
                            perm_type: PermType::Repos,
                            ids: BTreeSet::new(),
                            updated_at: Some(now),
                        },
                    );
                    self.pending_index.insert(key, id);
                    id
                }
            };
            pending_ids.insert(id);
        }

        let old = self
            .repo_pending
            .get(&perms.repo_id)
            .cloned()
            .unwrap_or_default();

        // Rows granted since the last write are gone; skip them.
        for id in pending_ids.difference(&old) {
            if let Some(row) = self.pending.get_mut(id) {
                row.ids.insert(perms.repo_id);
                row.updated_at = Some(now);
            }
        }
        for id in old.difference(&pending_ids) {
            if let Some(row) = self.pending.get_mut(id) {
                row.ids.remove(&perms.repo_id);
                row.updated_at = Some(now);
            }
        }

        self.repo_pending.insert(perms.repo_id, pending_ids);
    }

    fn grant_pending_permissions(
        &mut self,
        user_id: UserId,
        spec: &AccountSpec,
        now: DateTime<Utc>,
    ) -> usize {
        let key = (
            spec.service_type.clone(),
            spec.service_id.clone(),
            spec.account_id.clone(),
        );
        let Some(id) = self.pending_index.remove(&key) else {
            return 0;
        };
        let Some(pending) = self.pending.remove(&id) else {
            return 0;
        };

        for repo_id in &pending.ids {
            let row = self
                .repo_perms
                .entry(*repo_id)
                .or_insert_with(|| RepoPermissions::new(*repo_id, []));
            row.user_ids.insert(user_id);
            row.updated_at = Some(now);
        }

        let row = self
            .user_perms
            .entry(user_id)
            .or_insert_with(|| UserPermissions::new(user_id, []));
        row.ids.extend(pending.ids.iter().copied());
        row.updated_at = Some(now);

        pending.ids.len()
    }
}

#[derive(Debug, Default)]
struct EntityState {
    users: BTreeMap<UserId, User>,
    emails: HashMap<UserId, Vec<String>>,
    repos: BTreeMap<RepoId, Repo>,
    accounts: BTreeMap<i64, Account>,
    next_account_id: i64,
}

impl EntityState {
    fn upsert_account(&mut self, account: &Account, now: DateTime<Utc>) -> Account {
        let existing = self
            .accounts
            .values_mut()
            .find(|a| a.spec == account.spec);
        if let Some(existing) = existing {
            existing.user_id = account.user_id;
            existing.data = account.data.clone();
            existing.updated_at = now;
            existing.expired_at = None;
            return existing.clone();
        }

        self.next_account_id += 1;
        let mut stored = account.clone();
        stored.id = self.next_account_id;
        stored.created_at = now;
        stored.updated_at = now;
        self.accounts.insert(stored.id, stored.clone());
        stored
    }
}

#[derive(Debug, Default)]
struct JobsState {
    jobs: BTreeMap<i64, PermissionSyncJob>,
    next_id: i64,
}

fn chrono_age(age: Duration) -> chrono::Duration {
    chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Oldest-first selection shared by the user and repo variants. Rows never
/// synced directly sort before everything else.
fn oldest<K: Copy + Ord + std::hash::Hash>(
    rows: impl Iterator<Item = (K, Option<DateTime<Utc>>)>,
    cutoff: DateTime<Utc>,
    limit: usize,
) -> HashMap<K, DateTime<Utc>> {
    let mut candidates: Vec<(K, DateTime<Utc>)> = rows
        .filter(|(_, synced_at)| synced_at.is_none_or(|t| t <= cutoff))
        .map(|(id, synced_at)| (id, synced_at.unwrap_or(DateTime::<Utc>::MIN_UTC)))
        .collect();
    candidates.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
    candidates.into_iter().take(limit).collect()
}

/// Every store trait backed by process memory.
#[derive(Clone)]
pub struct MemoryStore {
    perms: Arc<Mutex<PermsState>>,
    entities: Arc<RwLock<EntityState>>,
    jobs: Arc<parking_lot::Mutex<JobsState>>,
    clock: Clock,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(Utc::now))
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            perms: Arc::new(Mutex::new(PermsState::default())),
            entities: Arc::new(RwLock::new(EntityState::default())),
            jobs: Arc::new(parking_lot::Mutex::new(JobsState::default())),
            clock,
        }
    }

    pub fn insert_user(&self, user: User) {
        self.entities.write().users.insert(user.id, user);
    }

    pub fn add_verified_email(&self, user_id: UserId, email: &str) {
        self.entities
            .write()
            .emails
            .entry(user_id)
            .or_default()
            .push(email.to_string());
    }

    pub fn insert_repo(&self, repo: Repo) {
        self.entities.write().repos.insert(repo.id, repo);
    }

    /// Stores the account as-is (including `expired_at`) and returns it with
    /// its assigned ID.
    pub fn insert_account(&self, account: Account) -> Account {
        let now = (self.clock)();
        let mut entities = self.entities.write();
        let expired_at = account.expired_at;
        let mut stored = entities.upsert_account(&account, now);
        stored.expired_at = expired_at;
        entities.accounts.insert(stored.id, stored.clone());
        stored
    }

    pub fn account(&self, id: i64) -> Option<Account> {
        self.entities.read().accounts.get(&id).cloned()
    }
}

pub struct MemoryTransaction {
    parent: OwnedMutexGuard<PermsState>,
    working: Mutex<PermsState>,
    entities: Arc<RwLock<EntityState>>,
    clock: Clock,
}

macro_rules! impl_perms_ops {
    ($ty:ty, $state:ident) => {
        #[async_trait]
        impl PermsOps for $ty {
            async fn load_user_permissions(
                &self,
                user_id: UserId,
            ) -> StoreResult<Option<UserPermissions>> {
                Ok(self.$state.lock().await.user_perms.get(&user_id).cloned())
            }

            async fn load_repo_permissions(
                &self,
                repo_id: RepoId,
            ) -> StoreResult<Option<RepoPermissions>> {
                Ok(self.$state.lock().await.repo_perms.get(&repo_id).cloned())
            }

            async fn set_user_permissions(
                &self,
                perms: &UserPermissions,
            ) -> StoreResult<PermsDiff> {
                let now = (self.clock)();
                Ok(self.$state.lock().await.set_user_permissions(perms, now))
            }

            async fn set_repo_permissions(
                &self,
                perms: &RepoPermissions,
            ) -> StoreResult<PermsDiff> {
                let now = (self.clock)();
                Ok(self.$state.lock().await.set_repo_permissions(perms, now))
            }

            async fn touch_user_permissions(&self, user_id: UserId) -> StoreResult<()> {
                let now = (self.clock)();
                self.$state.lock().await.touch_user(user_id, now);
                Ok(())
            }

            async fn touch_repo_permissions(&self, repo_id: RepoId) -> StoreResult<()> {
                let now = (self.clock)();
                self.$state.lock().await.touch_repo(repo_id, now);
                Ok(())
            }

            async fn set_repo_pending_permissions(
                &self,
                accounts: &Accounts,
                perms: &RepoPermissions,
            ) -> StoreResult<()> {
                let now = (self.clock)();
                self.$state
                    .lock()
                    .await
                    .set_repo_pending_permissions(accounts, perms, now);
                Ok(())
            }

            async fn load_user_pending_permissions(
                &self,
                spec: &AccountSpec,
            ) -> StoreResult<Option<UserPendingPermissions>> {
                let state = self.$state.lock().await;
                let key = (
                    spec.service_type.clone(),
                    spec.service_id.clone(),
                    spec.account_id.clone(),
                );
                Ok(state
                    .pending_index
                    .get(&key)
                    .and_then(|id| state.pending.get(id))
                    .cloned())
            }

            async fn grant_pending_permissions(
                &self,
                user_id: UserId,
                spec: &AccountSpec,
            ) -> StoreResult<usize> {
                let now = (self.clock)();
                Ok(self
                    .$state
                    .lock()
                    .await
                    .grant_pending_permissions(user_id, spec, now))
            }

            async fn set_sub_repo_permissions(
                &self,
                user_id: UserId,
                repo_id: RepoId,
                perms: &SubRepoPermissions,
            ) -> StoreResult<()> {
                self.$state
                    .lock()
                    .await
                    .sub_repo
                    .insert((user_id, repo_id), perms.clone());
                Ok(())
            }

            async fn load_sub_repo_permissions(
                &self,
                user_id: UserId,
                repo_id: RepoId,
            ) -> StoreResult<Option<SubRepoPermissions>> {
                Ok(self
                    .$state
                    .lock()
                    .await
                    .sub_repo
                    .get(&(user_id, repo_id))
                    .cloned())
            }

            async fn retain_sub_repo_permissions(
                &self,
                user_id: UserId,
                keep: &[RepoId],
            ) -> StoreResult<usize> {
                let mut state = self.$state.lock().await;
                let before = state.sub_repo.len();
                state
                    .sub_repo
                    .retain(|(uid, repo_id), _| *uid != user_id || keep.contains(repo_id));
                Ok(before - state.sub_repo.len())
            }

            async fn get_user_ids_by_external_accounts(
                &self,
                accounts: &Accounts,
            ) -> StoreResult<HashMap<String, UserId>> {
                let entities = self.entities.read();
                Ok(entities
                    .accounts
                    .values()
                    .filter(|a| {
                        a.spec.service_type == accounts.service_type
                            && a.spec.service_id == accounts.service_id
                            && accounts.account_ids.contains(&a.spec.account_id)
                    })
                    .map(|a| (a.spec.account_id.clone(), a.user_id))
                    .collect())
            }

            async fn user_ids_with_no_perms(&self) -> StoreResult<Vec<UserId>> {
                let state = self.$state.lock().await;
                let entities = self.entities.read();
                Ok(entities
                    .users
                    .keys()
                    .filter(|id| !state.user_perms.contains_key(id))
                    .copied()
                    .collect())
            }

            async fn repo_ids_with_no_perms(&self) -> StoreResult<Vec<RepoId>> {
                let state = self.$state.lock().await;
                let entities = self.entities.read();
                Ok(entities
                    .repos
                    .values()
                    .filter(|r| r.private && !state.repo_perms.contains_key(&r.id))
                    .map(|r| r.id)
                    .collect())
            }

            async fn user_ids_with_oldest_perms(
                &self,
                limit: usize,
                age: Duration,
            ) -> StoreResult<HashMap<UserId, DateTime<Utc>>> {
                let cutoff = (self.clock)() - chrono_age(age);
                let state = self.$state.lock().await;
                let entities = self.entities.read();
                let rows = state
                    .user_perms
                    .values()
                    .filter(|p| entities.users.contains_key(&p.user_id))
                    .map(|p| (p.user_id, p.synced_at));
                Ok(oldest(rows, cutoff, limit))
            }

            async fn repo_ids_with_oldest_perms(
                &self,
                limit: usize,
                age: Duration,
            ) -> StoreResult<HashMap<RepoId, DateTime<Utc>>> {
                let cutoff = (self.clock)() - chrono_age(age);
                let state = self.$state.lock().await;
                let entities = self.entities.read();
                let rows = state
                    .repo_perms
                    .values()
                    .filter(|p| entities.repos.contains_key(&p.repo_id))
                    .map(|p| (p.repo_id, p.synced_at));
                Ok(oldest(rows, cutoff, limit))
            }

            async fn delete_all_user_permissions(&self, user_id: UserId) -> StoreResult<()> {
                let mut state = self.$state.lock().await;
                if let Some(perms) = state.user_perms.remove(&user_id) {
                    for repo_id in perms.ids {
                        if let Some(row) = state.repo_perms.get_mut(&repo_id) {
                            row.user_ids.remove(&user_id);
                        }
                    }
                }
                state.sub_repo.retain(|(uid, _), _| *uid != user_id);
                Ok(())
            }
        }
    };
}

impl_perms_ops!(MemoryStore, perms);
impl_perms_ops!(MemoryTransaction, working);

#[async_trait]
impl PermsStore for MemoryStore {
    async fn transact(&self) -> StoreResult<Box<dyn PermsTransaction>> {
        let parent = self.perms.clone().lock_owned().await;
        let working = Mutex::new(parent.clone());
        Ok(Box::new(MemoryTransaction {
            parent,
            working,
            entities: self.entities.clone(),
            clock: self.clock.clone(),
        }))
    }
}

#[async_trait]
impl PermsTransaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTransaction {
            mut parent,
            working,
            ..
        } = *self;
        *parent = working.into_inner();
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn get_by_id(&self, id: UserId) -> StoreResult<Option<User>> {
        Ok(self.entities.read().users.get(&id).cloned())
    }

    async fn list(&self, ids: &[UserId]) -> StoreResult<Vec<User>> {
        let entities = self.entities.read();
        Ok(ids
            .iter()
            .filter_map(|id| entities.users.get(id).cloned())
            .collect())
    }

    async fn verified_emails(&self, id: UserId) -> StoreResult<Vec<String>> {
        Ok(self
            .entities
            .read()
            .emails
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl RepoStore for MemoryStore {
    async fn get_by_id(&self, id: RepoId) -> StoreResult<Option<Repo>> {
        Ok(self.entities.read().repos.get(&id).cloned())
    }

    async fn list(&self, opts: &RepoListOptions) -> StoreResult<Vec<Repo>> {
        let entities = self.entities.read();
        let matches_spec = |repo: &Repo, spec: &authz::ExternalRepoSpec, prefix: bool| {
            repo.external_repo.service_type == spec.service_type
                && repo.external_repo.service_id == spec.service_id
                && if prefix {
                    repo.external_repo.id.starts_with(&spec.id)
                } else {
                    repo.external_repo.id == spec.id
                }
        };

        Ok(entities
            .repos
            .values()
            .filter(|r| opts.ids.is_empty() || opts.ids.contains(&r.id))
            .filter(|r| !opts.only_private || r.private)
            .filter(|r| {
                opts.external_repos.is_empty()
                    || opts
                        .external_repos
                        .iter()
                        .any(|spec| matches_spec(r, spec, false))
            })
            .filter(|r| {
                opts.external_repo_include_contains.is_empty()
                    || opts
                        .external_repo_include_contains
                        .iter()
                        .any(|spec| matches_spec(r, spec, true))
            })
            .filter(|r| {
                !opts
                    .external_repo_exclude_contains
                    .iter()
                    .any(|spec| matches_spec(r, spec, true))
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ExternalAccountStore for MemoryStore {
    async fn list(&self, opts: &ExternalAccountsListOptions) -> StoreResult<Vec<Account>> {
        let entities = self.entities.read();
        Ok(entities
            .accounts
            .values()
            .filter(|a| opts.user_id.is_none_or(|id| a.user_id == id))
            .filter(|a| {
                opts.service_type
                    .as_ref()
                    .is_none_or(|t| &a.spec.service_type == t)
            })
            .filter(|a| {
                opts.service_id
                    .as_ref()
                    .is_none_or(|id| &a.spec.service_id == id)
            })
            .filter(|a| opts.account_ids.is_empty() || opts.account_ids.contains(&a.spec.account_id))
            .filter(|a| !opts.exclude_expired || !a.is_expired())
            .filter(|a| !opts.only_expired || a.is_expired())
            .cloned()
            .collect())
    }

    async fn upsert(&self, account: &Account) -> StoreResult<Account> {
        let now = (self.clock)();
        Ok(self.entities.write().upsert_account(account, now))
    }

    async fn touch_expired(&self, id: i64) -> StoreResult<()> {
        let now = (self.clock)();
        let mut entities = self.entities.write();
        let account = entities
            .accounts
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("external account", id))?;
        account.expired_at = Some(now);
        account.updated_at = now;
        Ok(())
    }

    async fn touch_last_valid(&self, id: i64) -> StoreResult<()> {
        let now = (self.clock)();
        let mut entities = self.entities.write();
        let account = entities
            .accounts
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("external account", id))?;
        account.expired_at = None;
        account.last_valid_at = Some(now);
        account.updated_at = now;
        Ok(())
    }
}

#[async_trait]
impl SyncJobStore for MemoryStore {
    async fn create(&self, job: &NewSyncJob) -> StoreResult<i64> {
        if !job.is_valid() {
            return Err(StoreError::InvalidData(
                "exactly one of user_id and repository_id must be set".to_string(),
            ));
        }
        let now = (self.clock)();
        let mut jobs = self.jobs.lock();
        jobs.next_id += 1;
        let id = jobs.next_id;
        jobs.jobs.insert(
            id,
            PermissionSyncJob {
                id,
                state: SyncJobState::Queued,
                user_id: job.user_id,
                repository_id: job.repository_id,
                priority: job.priority,
                invalidate_caches: job.invalidate_caches,
                reason: job.reason.clone(),
                failure_message: None,
                num_resets: 0,
                num_failures: 0,
                queued_at: now,
                started_at: None,
                finished_at: None,
                last_heartbeat_at: None,
                worker_hostname: None,
                code_host_states: None,
            },
        );
        Ok(id)
    }

    async fn get(&self, id: i64) -> StoreResult<Option<PermissionSyncJob>> {
        Ok(self.jobs.lock().jobs.get(&id).cloned())
    }

    async fn dequeue(&self, worker_hostname: &str) -> StoreResult<Option<PermissionSyncJob>> {
        let now = (self.clock)();
        let mut jobs = self.jobs.lock();
        let next = jobs
            .jobs
            .values()
            .filter(|j| j.state == SyncJobState::Queued)
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.queued_at.cmp(&b.queued_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let job = jobs
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("permission sync job", id))?;
        job.state = SyncJobState::Processing;
        job.started_at = Some(now);
        job.last_heartbeat_at = Some(now);
        job.worker_hostname = Some(worker_hostname.to_string());
        Ok(Some(job.clone()))
    }

    async fn heartbeat(&self, ids: &[i64]) -> StoreResult<()> {
        let now = (self.clock)();
        let mut jobs = self.jobs.lock();
        for id in ids {
            if let Some(job) = jobs.jobs.get_mut(id) {
                if job.state == SyncJobState::Processing {
                    job.last_heartbeat_at = Some(now);
                }
            }
        }
        Ok(())
    }

    async fn mark_complete(&self, id: i64, statuses: &CodeHostStatusesSet) -> StoreResult<()> {
        let now = (self.clock)();
        let mut jobs = self.jobs.lock();
        let job = jobs
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("permission sync job", id))?;
        job.state = SyncJobState::Completed;
        job.finished_at = Some(now);
        job.code_host_states = Some(statuses.clone());
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        message: &str,
        statuses: &CodeHostStatusesSet,
    ) -> StoreResult<()> {
        let now = (self.clock)();
        let mut jobs = self.jobs.lock();
        let job = jobs
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("permission sync job", id))?;
        job.state = SyncJobState::Failed;
        job.finished_at = Some(now);
        job.failure_message = Some(message.to_string());
        job.num_failures += 1;
        job.code_host_states = Some(statuses.clone());
        Ok(())
    }

    async fn reset_stalled(
        &self,
        stall_after: Duration,
        max_resets: i32,
    ) -> StoreResult<(Vec<i64>, Vec<i64>)> {
        let now = (self.clock)();
        let cutoff = now - chrono_age(stall_after);
        let mut reset = Vec::new();
        let mut failed = Vec::new();

        let mut jobs = self.jobs.lock();
        for job in jobs.jobs.values_mut() {
            let stalled = job.state == SyncJobState::Processing
                && job.last_heartbeat_at.is_none_or(|t| t <= cutoff);
            if !stalled {
                continue;
            }
            if job.num_resets < max_resets {
                job.state = SyncJobState::Queued;
                job.num_resets += 1;
                job.started_at = None;
                job.last_heartbeat_at = None;
                job.worker_hostname = None;
                reset.push(job.id);
            } else {
                job.state = SyncJobState::Failed;
                job.finished_at = Some(now);
                job.failure_message = Some("failed to process".to_string());
                failed.push(job.id);
            }
        }

        Ok((reset, failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authz::ExternalRepoSpec;

    fn user(id: UserId) -> User {
        User {
            id,
            username: format!("user{id}"),
            site_admin: false,
            created_at: Utc::now(),
        }
    }

    fn repo(id: RepoId, external_id: &str, private: bool) -> Repo {
        Repo {
            id,
            name: format!("github.com/org/repo{id}"),
            private,
            external_repo: ExternalRepoSpec {
                id: external_id.to_string(),
                service_type: "github".to_string(),
                service_id: "https://github.com/".to_string(),
            },
            sources: BTreeMap::new(),
        }
    }

    fn github_spec(account_id: &str) -> AccountSpec {
        AccountSpec {
            service_type: "github".to_string(),
            service_id: "https://github.com/".to_string(),
            client_id: String::new(),
            account_id: account_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_set_user_permissions_updates_repo_side() {
        let store = MemoryStore::new();
        let diff = store
            .set_user_permissions(&UserPermissions::new(1, [1, 2]))
            .await
            .unwrap();
        assert_eq!(diff.added, 2);
        assert_eq!(diff.removed, 0);

        let diff = store
            .set_user_permissions(&UserPermissions::new(1, [2, 3]))
            .await
            .unwrap();
        assert_eq!((diff.added, diff.removed, diff.found), (1, 1, 2));

        let repo1 = store.load_repo_permissions(1).await.unwrap().unwrap();
        assert!(repo1.user_ids.is_empty());
        let repo3 = store.load_repo_permissions(3).await.unwrap().unwrap();
        assert_eq!(repo3.sorted_user_ids(), vec![1]);

        let perms = store.load_user_permissions(1).await.unwrap().unwrap();
        assert_eq!(perms.sorted_ids(), vec![2, 3]);
        assert!(perms.synced_at.is_some());
    }

    #[tokio::test]
    async fn test_touch_creates_empty_row() {
        let store = MemoryStore::new();
        store.touch_user_permissions(7).await.unwrap();
        let perms = store.load_user_permissions(7).await.unwrap().unwrap();
        assert!(perms.ids.is_empty());
        assert!(perms.synced_at.is_some());
    }

    #[tokio::test]
    async fn test_retain_sub_repo_permissions() {
        let store = MemoryStore::new();
        let rules = SubRepoPermissions {
            path_includes: vec!["/src/**".to_string()],
            path_excludes: Vec::new(),
        };
        for (user_id, repo_id) in [(1, 10), (1, 11), (2, 10)] {
            store
                .set_sub_repo_permissions(user_id, repo_id, &rules)
                .await
                .unwrap();
        }

        assert_eq!(store.retain_sub_repo_permissions(1, &[11]).await.unwrap(), 1);
        assert!(store.load_sub_repo_permissions(1, 10).await.unwrap().is_none());
        assert!(store.load_sub_repo_permissions(1, 11).await.unwrap().is_some());
        assert!(store.load_sub_repo_permissions(2, 10).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_transaction_rollback_on_drop() {
        let store = MemoryStore::new();
        {
            let tx = store.transact().await.unwrap();
            tx.set_repo_permissions(&RepoPermissions::new(1, [5]))
                .await
                .unwrap();
        }
        assert!(store.load_repo_permissions(1).await.unwrap().is_none());

        let tx = store.transact().await.unwrap();
        tx.set_repo_permissions(&RepoPermissions::new(1, [5]))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        let perms = store.load_user_permissions(5).await.unwrap().unwrap();
        assert_eq!(perms.sorted_ids(), vec![1]);
    }

    #[tokio::test]
    async fn test_pending_permissions_granted() {
        let store = MemoryStore::new();
        let accounts = Accounts {
            service_type: "github".to_string(),
            service_id: "https://github.com/".to_string(),
            account_ids: vec!["alice".to_string(), "bob".to_string()],
        };
        store
            .set_repo_pending_permissions(&accounts, &RepoPermissions::new(1, []))
            .await
            .unwrap();
        store
            .set_repo_pending_permissions(&accounts, &RepoPermissions::new(2, []))
            .await
            .unwrap();

        let pending = store
            .load_user_pending_permissions(&github_spec("alice"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.ids.iter().copied().collect::<Vec<_>>(), vec![1, 2]);

        let granted = store
            .grant_pending_permissions(9, &github_spec("alice"))
            .await
            .unwrap();
        assert_eq!(granted, 2);
        let perms = store.load_user_permissions(9).await.unwrap().unwrap();
        assert_eq!(perms.sorted_ids(), vec![1, 2]);
        assert!(
            store
                .load_user_pending_permissions(&github_spec("alice"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_no_perms_and_oldest() {
        let store = MemoryStore::new();
        store.insert_user(user(1));
        store.insert_user(user(2));
        store.insert_repo(repo(10, "R10", true));
        store.insert_repo(repo(11, "R11", false));

        store.touch_user_permissions(1).await.unwrap();
        assert_eq!(store.user_ids_with_no_perms().await.unwrap(), vec![2]);
        assert_eq!(store.repo_ids_with_no_perms().await.unwrap(), vec![10]);

        let oldest = store
            .user_ids_with_oldest_perms(10, Duration::ZERO)
            .await
            .unwrap();
        assert!(oldest.contains_key(&1));
        let none = store
            .user_ids_with_oldest_perms(10, Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_repo_list_prefix_matching() {
        let store = MemoryStore::new();
        store.insert_repo(repo(1, "//depot/main/a", true));
        store.insert_repo(repo(2, "//depot/main/secret", true));
        store.insert_repo(repo(3, "//depot/other", true));

        let spec = |id: &str| ExternalRepoSpec {
            id: id.to_string(),
            service_type: "github".to_string(),
            service_id: "https://github.com/".to_string(),
        };
        let repos = RepoStore::list(
            &store,
            &RepoListOptions {
                only_private: true,
                external_repo_include_contains: vec![spec("//depot/main/")],
                external_repo_exclude_contains: vec![spec("//depot/main/secret")],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(repos.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn test_job_lifecycle_and_reset() {
        let store = MemoryStore::new();
        let low = store
            .create(&NewSyncJob::user(1, crate::jobs::SyncJobPriority::Low))
            .await
            .unwrap();
        let high = store
            .create(&NewSyncJob::repo(2, crate::jobs::SyncJobPriority::High))
            .await
            .unwrap();

        let job = store.dequeue("worker-1").await.unwrap().unwrap();
        assert_eq!(job.id, high);
        assert_eq!(job.state, SyncJobState::Processing);

        store
            .mark_complete(high, &CodeHostStatusesSet::new())
            .await
            .unwrap();
        assert_eq!(
            store.get(high).await.unwrap().unwrap().state,
            SyncJobState::Completed
        );

        let job = store.dequeue("worker-1").await.unwrap().unwrap();
        assert_eq!(job.id, low);
        let (reset, failed) = store.reset_stalled(Duration::ZERO, 1).await.unwrap();
        assert_eq!(reset, vec![low]);
        assert!(failed.is_empty());

        store.dequeue("worker-1").await.unwrap().unwrap();
        let (reset, failed) = store.reset_stalled(Duration::ZERO, 1).await.unwrap();
        assert!(reset.is_empty());
        assert_eq!(failed, vec![low]);
    }

    #[tokio::test]
    async fn test_external_accounts_expiry() {
        let store = MemoryStore::new();
        let account = store.insert_account(Account::new(1, github_spec("42")));
        store.touch_expired(account.id).await.unwrap();

        let active = ExternalAccountStore::list(
            &store,
            &ExternalAccountsListOptions {
                user_id: Some(1),
                exclude_expired: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(active.is_empty());

        store.touch_last_valid(account.id).await.unwrap();
        assert!(!store.account(account.id).unwrap().is_expired());
    }
}

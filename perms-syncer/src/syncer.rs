//! The permissions sync orchestrator.
//!
//! [`PermsSyncer`] drains the [`RequestQueue`], runs each request on the
//! concurrency pool of its type, calls the matching code-host providers and
//! reconciles the results into the permissions store.

use crate::error::{PermsSyncError, PermsSyncResult};
use crate::telemetry::{SyncTimer, Telemetry};
use crate::queue::{Priority, RequestMeta, RequestQueue, RequestType, SyncRequest};
use crate::rate_limit::RateLimiterRegistry;
use authz::{CodeHostStatusesSet, ProviderSource, RepoId, UserId};
use config::SyncerConfig;
use errors::{ProviderError, ProviderResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use storage::{ExternalAccountStore, PermsDiff, PermsStore, RepoStore, UserStore};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// The stores a sync reads from and writes to.
#[derive(Clone)]
pub struct Stores {
    pub perms: Arc<dyn PermsStore>,
    pub users: Arc<dyn UserStore>,
    pub repos: Arc<dyn RepoStore>,
    pub accounts: Arc<dyn ExternalAccountStore>
}

impl Stores {
    /// Uses one backend for every store.
    pub fn from_backend<S>(store: S) -> Self
    where
        S: PermsStore + UserStore + RepoStore + ExternalAccountStore + Clone + 'static
    {
        Self {
            perms: Arc::new(store.clone()),
            users: Arc::new(store.clone()),
            repos: Arc::new(store.clone()),
            accounts: Arc::new(store)
        }
    }
}

/// Result of syncing one user or repository.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    /// Repository IDs after a user sync, user IDs after a repository sync.
    pub ids: Vec<i32>,
    /// `None` when only the sync timestamp was refreshed.
    pub diff: Option<PermsDiff>,
    pub statuses: CodeHostStatusesSet
}

pub struct PermsSyncer {
    pub(crate) queue: Arc<RequestQueue>,
    pub(crate) stores: Stores,
    pub(crate) providers: Arc<dyn ProviderSource>,
    rate_limiters: RateLimiterRegistry,
    user_pool: Arc<Semaphore>,
    repo_pool: Arc<Semaphore>,
    poll_interval: Duration,
    request_timeout: Duration
}

impl PermsSyncer {
    pub fn new(stores: Stores, providers: Arc<dyn ProviderSource>, config: &SyncerConfig) -> Self {
        Self {
            queue: Arc::new(RequestQueue::new()),
            stores,
            providers,
            rate_limiters: RateLimiterRegistry::new(config.rate_limit_per_second),
            user_pool: Arc::new(Semaphore::new(config.user_sync_concurrency.max(1))),
            repo_pool: Arc::new(Semaphore::new(config.repo_sync_concurrency.max(1))),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            request_timeout: Duration::from_secs(config.request_timeout_seconds)
        }
    }

    pub fn with_rate_limiters(mut self, rate_limiters: RateLimiterRegistry) -> Self {
        self.rate_limiters = rate_limiters;
        self
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn providers(&self) -> &Arc<dyn ProviderSource> {
        &self.providers
    }

    /// Adds a request to the queue. Returns `true` when an already queued
    /// request was upgraded.
    pub fn enqueue(&self, meta: RequestMeta) -> bool {
        let request_type = meta.request_type;
        let updated = self.queue.enqueue(meta);
        if updated {
            Telemetry::record_queue_update(request_type);
        }
        Telemetry::set_queue_size(self.queue.len());
        updated
    }

    /// Queues ad hoc syncs for the given users.
    pub fn schedule_users(&self, priority: Priority, user_ids: &[UserId], invalidate_caches: bool) {
        for &id in user_ids {
            self.enqueue(RequestMeta::user(id, priority).with_invalidate_caches(invalidate_caches));
        }
        debug!(count = user_ids.len(), %priority, "Scheduled user permissions syncs");
    }

    /// Queues ad hoc syncs for the given repositories.
    pub fn schedule_repos(&self, priority: Priority, repo_ids: &[RepoId], invalidate_caches: bool) {
        for &id in repo_ids {
            self.enqueue(RequestMeta::repo(id, priority).with_invalidate_caches(invalidate_caches));
        }
        debug!(count = repo_ids.len(), %priority, "Scheduled repository permissions syncs");
    }

    /// Consumer loop. Acquires queued requests while their type's pool has a
    /// free slot and runs each one on that slot until `shutdown` flips to
    /// `true`; then waits for in-flight syncs.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            user_pool = self.user_pool.available_permits(),
            repo_pool = self.repo_pool.available_permits(),
            "Permissions syncer started"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.spawn_ready(&mut tasks);

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Sync task panicked");
                    }
                }
                () = self.queue.notified() => {}
                _ = ticker.tick() => {}
            }
        }

        self.user_pool.close();
        self.repo_pool.close();
        while tasks.join_next().await.is_some() {}
        info!("Permissions syncer stopped");
    }

    /// Spawns queued requests until no pool with a free slot has work. The
    /// slot is taken before the request, so a request only leaves the pending
    /// set when it can start right away.
    fn spawn_ready(self: &Arc<Self>, tasks: &mut JoinSet<()>) {
        loop {
            let user_permit = Arc::clone(&self.user_pool).try_acquire_owned().ok();
            let repo_permit = Arc::clone(&self.repo_pool).try_acquire_owned().ok();
            let next = self.queue.acquire_next_where(|request_type| match request_type {
                RequestType::User => user_permit.is_some(),
                RequestType::Repo => repo_permit.is_some(),
                RequestType::Unknown => true
            });
            let Some(request) = next else {
                return;
            };

            let permit = match request.meta.request_type {
                RequestType::User => user_permit,
                RequestType::Repo => repo_permit,
                RequestType::Unknown => None
            };
            let syncer = Arc::clone(self);
            tasks.spawn(async move {
                // Failures are logged and counted inside `sync_with_permit`.
                let _ = syncer.sync_with_permit(&request, permit).await;
            });
        }
    }

    /// Syncs the entity behind `request`, waiting for a slot on its type's
    /// pool.
    ///
    /// An acquired request is removed from the queue when this returns,
    /// whatever the outcome. Failed syncs are not retried here; the next
    /// scheduling pass picks them up again.
    pub async fn sync_perms(&self, request: &SyncRequest) -> PermsSyncResult<SyncOutcome> {
        self.sync_with_permit(request, None).await
    }

    /// Syncs `meta` outside the consumer loop. The entity is claimed in the
    /// queue first, so this waits while another sync for it is in flight.
    pub async fn sync_now(&self, meta: RequestMeta) -> PermsSyncResult<SyncOutcome> {
        let request = loop {
            if let Some(request) = self.queue.claim(meta.clone()) {
                break request;
            }
            debug!(
                request_type = %meta.request_type,
                id = meta.id,
                "Sync already in flight, waiting"
            );
            tokio::time::sleep(self.poll_interval).await;
        };
        Telemetry::set_queue_size(self.queue.len());
        self.sync_perms(&request).await
    }

    #[tracing::instrument(
        skip(self, request, permit),
        fields(request_type = %request.meta.request_type, id = request.meta.id)
    )]
    async fn sync_with_permit(
        &self,
        request: &SyncRequest,
        permit: Option<OwnedSemaphorePermit>
    ) -> PermsSyncResult<SyncOutcome> {
        let meta = &request.meta;
        let timer = SyncTimer::new(meta.request_type);

        let result = self.dispatch(meta, permit).await;

        if request.acquired {
            self.queue.remove(meta.request_type, meta.id, true);
        }
        Telemetry::set_queue_size(self.queue.len());

        match &result {
            Ok(outcome) => {
                timer.finish(true);
                let (succeeded, failed) = outcome.statuses.count_statuses();
                debug!(
                    ids = outcome.ids.len(),
                    touched_only = outcome.diff.is_none(),
                    providers_succeeded = succeeded,
                    providers_failed = failed,
                    "Synced permissions"
                );
            }
            Err(e) => {
                timer.finish(false);
                Telemetry::record_sync_error(meta.request_type, e.reason());
                error!(error = %e, "Failed to sync permissions");
            }
        }
        result
    }

    async fn dispatch(
        &self,
        meta: &RequestMeta,
        permit: Option<OwnedSemaphorePermit>
    ) -> PermsSyncResult<SyncOutcome> {
        let opts = meta.fetch_options();
        match meta.request_type {
            RequestType::User => {
                let _permit = slot(&self.user_pool, permit, "user").await?;
                self.sync_user_perms(meta.id, meta.no_perms, &opts).await
            }
            RequestType::Repo => {
                let _permit = slot(&self.repo_pool, permit, "repo").await?;
                self.sync_repo_perms(meta.id, meta.no_perms, &opts).await
            }
            RequestType::Unknown => {
                warn!(id = meta.id, "Dropping request with unknown type");
                Err(PermsSyncError::InvalidRequest(format!(
                    "unknown request type for id {}",
                    meta.id
                )))
            }
        }
    }

    /// Waits for the provider's rate limiter, then runs `fetch` bounded by the
    /// request timeout.
    pub(crate) async fn call_provider<T>(
        &self,
        urn: &str,
        fetch: impl Future<Output = ProviderResult<T>>
    ) -> ProviderResult<T> {
        self.rate_limiters.wait(urn).await;
        match tokio::time::timeout(self.request_timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::timeout(format!(
                "request to {} exceeded {}s",
                urn,
                self.request_timeout.as_secs()
            )))
        }
    }
}

/// Uses the slot taken by the consumer loop, or waits for one.
async fn slot(
    pool: &Arc<Semaphore>,
    held: Option<OwnedSemaphorePermit>,
    request_type: &'static str
) -> PermsSyncResult<OwnedSemaphorePermit> {
    match held {
        Some(permit) => Ok(permit),
        None => Arc::clone(pool)
            .acquire_owned()
            .await
            .map_err(|_| PermsSyncError::PoolClosed { request_type })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authz::{AuthzSnapshot, ProviderSet};
    use storage::{MemoryStore, PermsOps};

    fn syncer(store: &MemoryStore) -> PermsSyncer {
        PermsSyncer::new(
            Stores::from_backend(store.clone()),
            Arc::new(AuthzSnapshot::new(true, ProviderSet::default())),
            &SyncerConfig::default()
        )
    }

    #[tokio::test]
    async fn test_unknown_request_type_is_dropped() {
        let store = MemoryStore::new();
        let syncer = syncer(&store);
        syncer.enqueue(RequestMeta::new(RequestType::Unknown, 9, Priority::High));

        let request = syncer.queue().acquire_next().unwrap();
        let result = syncer.sync_perms(&request).await;
        assert!(matches!(result, Err(PermsSyncError::InvalidRequest(_))));
        assert!(syncer.queue().is_empty());
    }

    #[tokio::test]
    async fn test_no_providers_touches_without_changing_permissions() {
        let store = MemoryStore::new();
        store.insert_user(authz::User {
            id: 1,
            username: "alice".to_string(),
            site_admin: false,
            created_at: chrono::Utc::now()
        });
        store
            .set_user_permissions(&authz::UserPermissions::new(1, [10, 11]))
            .await
            .unwrap();
        let syncer = syncer(&store);

        let outcome = syncer
            .sync_user_perms(1, false, &Default::default())
            .await
            .unwrap();
        assert!(outcome.diff.is_none());
        assert!(outcome.statuses.is_empty());

        let perms = store.load_user_permissions(1).await.unwrap().unwrap();
        assert_eq!(perms.sorted_ids(), vec![10, 11]);
    }

    #[tokio::test]
    async fn test_no_providers_skips_unknown_user() {
        let store = MemoryStore::new();
        let syncer = syncer(&store);

        let outcome = syncer
            .sync_user_perms(404, false, &Default::default())
            .await
            .unwrap();
        assert!(outcome.diff.is_none());
        assert!(store.load_user_permissions(404).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fresh_request_does_not_remove_acquired_entry() {
        let store = MemoryStore::new();
        let syncer = syncer(&store);
        syncer.enqueue(RequestMeta::repo(3, Priority::Low));
        let acquired = syncer.queue().acquire_next().unwrap();

        syncer
            .sync_perms(&SyncRequest::new(RequestMeta::repo(3, Priority::High)))
            .await
            .unwrap();
        assert_eq!(syncer.queue().len(), 1);
        assert!(syncer.queue().claim(acquired.meta.clone()).is_none());

        syncer.sync_perms(&acquired).await.unwrap();
        assert!(syncer.queue().is_empty());
    }

    #[tokio::test]
    async fn test_schedule_users_deduplicates() {
        let store = MemoryStore::new();
        let syncer = syncer(&store);
        syncer.schedule_users(Priority::Low, &[1, 2, 1], false);
        syncer.schedule_repos(Priority::High, &[1], true);
        assert_eq!(syncer.queue().len(), 3);

        let first = syncer.queue().acquire_next().unwrap();
        assert_eq!(first.meta.request_type, RequestType::Repo);
        assert!(first.meta.invalidate_caches);
    }

    #[tokio::test]
    async fn test_call_provider_times_out() {
        let store = MemoryStore::new();
        let mut config = SyncerConfig::default();
        config.request_timeout_seconds = 0;
        let syncer = PermsSyncer::new(
            Stores::from_backend(store),
            Arc::new(AuthzSnapshot::new(true, ProviderSet::default())),
            &config
        );

        let result: ProviderResult<()> = syncer
            .call_provider("extsvc:github:1", async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            })
            .await;
        assert!(result.unwrap_err().is_temporary());
    }
}

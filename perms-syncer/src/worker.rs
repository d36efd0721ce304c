//! Durable job processing.
//!
//! [`Worker`] polls the [`SyncJobStore`] for queued permission sync jobs and
//! hands each one to a [`JobHandler`]; [`Resetter`] requeues jobs whose
//! worker stopped sending heartbeats.

use crate::error::{PermsSyncError, PermsSyncResult};
use crate::telemetry::Telemetry;
use crate::queue::{Priority, RequestMeta};
use crate::syncer::PermsSyncer;
use async_trait::async_trait;
use authz::CodeHostStatusesSet;
use config::WorkerConfig;
use std::sync::Arc;
use std::time::Duration;
use storage::{PermissionSyncJob, SyncJobPriority, SyncJobStore};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Processes one claimed job. Returns the per-provider outcome to store
    /// with the completed job.
    async fn handle(&self, job: &PermissionSyncJob) -> PermsSyncResult<CodeHostStatusesSet>;
}

/// Runs durable jobs through the orchestrator. A job waits while the consumer
/// loop is syncing the same user or repository.
pub struct SyncJobHandler {
    syncer: Arc<PermsSyncer>
}

impl SyncJobHandler {
    pub fn new(syncer: Arc<PermsSyncer>) -> Self {
        Self { syncer }
    }
}

#[async_trait]
impl JobHandler for SyncJobHandler {
    async fn handle(&self, job: &PermissionSyncJob) -> PermsSyncResult<CodeHostStatusesSet> {
        let meta = request_from_job(job)?;
        let outcome = self.syncer.sync_now(meta).await?;
        Ok(outcome.statuses)
    }
}

/// Maps a persisted job onto an in-memory sync request.
pub fn request_from_job(job: &PermissionSyncJob) -> PermsSyncResult<RequestMeta> {
    let priority = if job.priority == SyncJobPriority::High {
        Priority::High
    } else {
        Priority::Low
    };
    let meta = match (job.user_id, job.repository_id) {
        (Some(user_id), None) => RequestMeta::user(user_id, priority),
        (None, Some(repo_id)) => RequestMeta::repo(repo_id, priority),
        _ => {
            return Err(PermsSyncError::InvalidRequest(format!(
                "job {} must reference exactly one of user and repository",
                job.id
            )));
        }
    };
    Ok(meta
        .with_last_updated(job.queued_at)
        .with_invalidate_caches(job.invalidate_caches))
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub poll_interval: Duration,
    pub num_handlers: usize,
    pub heartbeat_interval: Duration,
    pub hostname: String
}

impl WorkerOptions {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            num_handlers: config.num_handlers.max(1),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_seconds),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "perms-syncer".to_string())
        }
    }
}

pub struct Worker {
    store: Arc<dyn SyncJobStore>,
    handler: Arc<dyn JobHandler>,
    options: WorkerOptions
}

impl Worker {
    pub fn new(
        store: Arc<dyn SyncJobStore>,
        handler: Arc<dyn JobHandler>,
        options: WorkerOptions
    ) -> Self {
        Self {
            store,
            handler,
            options
        }
    }

    /// Polls for jobs until `shutdown` flips to `true`, running up to
    /// `num_handlers` at a time. Jobs in progress are finished before
    /// returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            num_handlers = self.options.num_handlers,
            hostname = %self.options.hostname,
            "Permission sync job worker started"
        );
        let handlers = Arc::new(Semaphore::new(self.options.num_handlers));
        let mut ticker = tokio::time::interval(self.options.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {}
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Job handler panicked");
                }
            }

            while let Ok(permit) = Arc::clone(&handlers).try_acquire_owned() {
                match self.store.dequeue(&self.options.hostname).await {
                    Ok(Some(job)) => {
                        let worker = Arc::clone(&self);
                        tasks.spawn(async move {
                            let _permit = permit;
                            worker.process(job).await;
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "Failed to dequeue permission sync job");
                        break;
                    }
                }
            }
        }

        while tasks.join_next().await.is_some() {}
        info!("Permission sync job worker stopped");
    }

    /// Claims and processes a single job. Returns its ID, or `None` when the
    /// queue is empty.
    pub async fn process_next(&self) -> PermsSyncResult<Option<i64>> {
        let Some(job) = self.store.dequeue(&self.options.hostname).await? else {
            return Ok(None);
        };
        let id = job.id;
        self.process(job).await;
        Ok(Some(id))
    }

    async fn process(&self, job: PermissionSyncJob) {
        let id = job.id;
        let store = Arc::clone(&self.store);
        let interval = self.options.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = store.heartbeat(&[id]).await {
                    warn!(job_id = id, error = %e, "Failed to record job heartbeat");
                }
            }
        });

        let result = self.handler.handle(&job).await;
        heartbeat.abort();

        let recorded = match &result {
            Ok(statuses) => {
                debug!(job_id = id, "Permission sync job completed");
                self.store.mark_complete(id, statuses).await
            }
            Err(e) => {
                warn!(job_id = id, error = %e, "Permission sync job failed");
                self.store
                    .mark_failed(id, &e.to_string(), &CodeHostStatusesSet::new())
                    .await
            }
        };
        if let Err(e) = recorded {
            error!(job_id = id, error = %e, "Failed to record job outcome");
        }
    }
}

/// Requeues jobs stuck in `processing`.
pub struct Resetter {
    store: Arc<dyn SyncJobStore>,
    interval: Duration,
    stall_after: Duration,
    max_num_resets: i32
}

impl Resetter {
    pub fn new(store: Arc<dyn SyncJobStore>, config: &WorkerConfig) -> Self {
        Self {
            store,
            interval: Duration::from_secs(config.reset_interval_seconds),
            stall_after: Duration::from_secs(config.stall_after_seconds),
            max_num_resets: config.max_num_resets
        }
    }

    /// Returns the `(reset, failed)` job IDs.
    pub async fn reset_once(&self) -> PermsSyncResult<(Vec<i64>, Vec<i64>)> {
        let (reset, failed) = self
            .store
            .reset_stalled(self.stall_after, self.max_num_resets)
            .await?;
        if !reset.is_empty() || !failed.is_empty() {
            warn!(
                reset = reset.len(),
                failed = failed.len(),
                "Reset stalled permission sync jobs"
            );
        }
        Telemetry::record_jobs_reset(reset.len(), failed.len());
        Ok((reset, failed))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reset_once().await {
                        error!(error = %e, "Failed to reset stalled jobs");
                    }
                }
            }
        }
        debug!("Permission sync job resetter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RequestType;
    use parking_lot::Mutex;
    use storage::{MemoryStore, NewSyncJob, SyncJobState};

    struct RecordingHandler {
        seen: Mutex<Vec<i64>>,
        fail: bool
    }

    #[async_trait]
    impl JobHandler for RecordingHandler {
        async fn handle(&self, job: &PermissionSyncJob) -> PermsSyncResult<CodeHostStatusesSet> {
            self.seen.lock().push(job.id);
            if self.fail {
                return Err(PermsSyncError::InvalidRequest("boom".to_string()));
            }
            let mut statuses = CodeHostStatusesSet::new();
            statuses.push_success("extsvc:github:1", "github");
            Ok(statuses)
        }
    }

    fn options() -> WorkerOptions {
        WorkerOptions {
            poll_interval: Duration::from_millis(10),
            num_handlers: 2,
            heartbeat_interval: Duration::from_secs(1),
            hostname: "test-worker".to_string()
        }
    }

    #[test]
    fn test_request_from_job() {
        let job = PermissionSyncJob {
            id: 1,
            state: SyncJobState::Processing,
            user_id: None,
            repository_id: Some(42),
            priority: SyncJobPriority::Medium,
            invalidate_caches: true,
            reason: None,
            failure_message: None,
            num_resets: 0,
            num_failures: 0,
            queued_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
            last_heartbeat_at: None,
            worker_hostname: None,
            code_host_states: None
        };
        let meta = request_from_job(&job).unwrap();
        assert_eq!(meta.request_type, RequestType::Repo);
        assert_eq!(meta.id, 42);
        assert_eq!(meta.priority, Priority::Low);
        assert!(meta.invalidate_caches);

        let invalid = PermissionSyncJob {
            user_id: Some(1),
            ..job
        };
        assert!(matches!(
            request_from_job(&invalid),
            Err(PermsSyncError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_process_next_marks_complete() {
        let store = MemoryStore::new();
        let id = store
            .create(&NewSyncJob::user(1, SyncJobPriority::High))
            .await
            .unwrap();
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
            fail: false
        });
        let worker = Worker::new(Arc::new(store.clone()), handler.clone(), options());

        assert_eq!(worker.process_next().await.unwrap(), Some(id));
        assert_eq!(worker.process_next().await.unwrap(), None);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, SyncJobState::Completed);
        assert_eq!(job.code_host_states.unwrap().len(), 1);
        assert_eq!(*handler.seen.lock(), vec![id]);
    }

    #[tokio::test]
    async fn test_process_next_marks_failed() {
        let store = MemoryStore::new();
        let id = store
            .create(&NewSyncJob::repo(3, SyncJobPriority::Low))
            .await
            .unwrap();
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
            fail: true
        });
        let worker = Worker::new(Arc::new(store.clone()), handler, options());
        worker.process_next().await.unwrap();

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, SyncJobState::Failed);
        assert_eq!(job.failure_message.as_deref(), Some("Invalid request: boom"));
    }

    #[tokio::test]
    async fn test_run_drains_queue_until_shutdown() {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for user_id in 1..=3 {
            ids.push(
                store
                    .create(&NewSyncJob::user(user_id, SyncJobPriority::Low))
                    .await
                    .unwrap()
            );
        }
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
            fail: false
        });
        let worker = Arc::new(Worker::new(
            Arc::new(store.clone()),
            handler.clone(),
            options()
        ));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));
        for _ in 0..100 {
            if handler.seen.lock().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        for id in ids {
            let job = store.get(id).await.unwrap().unwrap();
            assert_eq!(job.state, SyncJobState::Completed);
        }
    }

    #[tokio::test]
    async fn test_resetter_requeues_stalled_jobs() {
        let store = MemoryStore::new();
        let id = store
            .create(&NewSyncJob::user(1, SyncJobPriority::Low))
            .await
            .unwrap();
        store.dequeue("crashed-worker").await.unwrap().unwrap();

        let config = WorkerConfig {
            stall_after_seconds: 0,
            ..WorkerConfig::default()
        };
        let resetter = Resetter::new(Arc::new(store.clone()), &config);

        let (reset, failed) = resetter.reset_once().await.unwrap();
        assert_eq!(reset, vec![id]);
        assert!(failed.is_empty());
        assert_eq!(
            store.get(id).await.unwrap().unwrap().state,
            SyncJobState::Queued
        );
    }
}

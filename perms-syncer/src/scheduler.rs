use crate::error::{PermsSyncError, PermsSyncResult};
use crate::telemetry::Telemetry;
use crate::queue::{Priority, RequestMeta, RequestType};
use crate::syncer::PermsSyncer;
use chrono::{DateTime, Utc};
use config::SchedulerConfig;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// What one scheduling pass queued.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleReport {
    pub users_with_no_perms: usize,
    pub repos_with_no_perms: usize,
    pub stale_users: usize,
    pub stale_repos: usize
}

/// Queues every user and repository that was never synced at `High`
/// priority, and the stalest ones at `Low` priority.
pub async fn schedule_once(
    syncer: &PermsSyncer,
    config: &SchedulerConfig
) -> PermsSyncResult<ScheduleReport> {
    let perms = &syncer.stores().perms;
    let age = Duration::from_secs(config.min_stale_age_seconds);

    let users = perms.user_ids_with_no_perms().await?;
    let repos = perms.repo_ids_with_no_perms().await?;
    let stale_users = perms
        .user_ids_with_oldest_perms(config.sync_oldest_users, age)
        .await?;
    let stale_repos = perms
        .repo_ids_with_oldest_perms(config.sync_oldest_repos, age)
        .await?;

    for &id in &users {
        syncer.enqueue(never_synced(RequestMeta::user(id, Priority::High)));
    }
    for &id in &repos {
        syncer.enqueue(never_synced(RequestMeta::repo(id, Priority::High)));
    }
    for (&id, &synced_at) in &stale_users {
        syncer.enqueue(RequestMeta::user(id, Priority::Low).with_last_updated(synced_at));
    }
    for (&id, &synced_at) in &stale_repos {
        syncer.enqueue(RequestMeta::repo(id, Priority::Low).with_last_updated(synced_at));
    }

    Telemetry::set_no_perms(RequestType::User, users.len());
    Telemetry::set_no_perms(RequestType::Repo, repos.len());
    Telemetry::set_stale_perms(RequestType::User, stale_users.len());
    Telemetry::set_stale_perms(RequestType::Repo, stale_repos.len());

    Ok(ScheduleReport {
        users_with_no_perms: users.len(),
        repos_with_no_perms: repos.len(),
        stale_users: stale_users.len(),
        stale_repos: stale_repos.len()
    })
}

fn never_synced(meta: RequestMeta) -> RequestMeta {
    meta.with_no_perms(true)
        .with_last_updated(DateTime::<Utc>::UNIX_EPOCH)
}

/// Periodic full resync.
pub struct PermsScheduler {
    scheduler: JobScheduler,
    syncer: Arc<PermsSyncer>,
    config: SchedulerConfig,
    last_report: Arc<RwLock<Option<ScheduleReport>>>
}

impl PermsScheduler {
    pub async fn new(syncer: Arc<PermsSyncer>, config: &SchedulerConfig) -> PermsSyncResult<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| PermsSyncError::Scheduler(e.to_string()))?;

        let last_report = Arc::new(RwLock::new(None));
        let syncer_clone = syncer.clone();
        let report_clone = last_report.clone();
        let config_clone = config.clone();

        let job = Job::new_repeated_async(
            Duration::from_secs(config.interval_seconds),
            move |_uuid, _lock| {
                let syncer = syncer_clone.clone();
                let report = report_clone.clone();
                let config = config_clone.clone();
                Box::pin(async move {
                    match schedule_once(&syncer, &config).await {
                        Ok(schedule) => {
                            info!(
                                users_with_no_perms = schedule.users_with_no_perms,
                                repos_with_no_perms = schedule.repos_with_no_perms,
                                stale_users = schedule.stale_users,
                                stale_repos = schedule.stale_repos,
                                "Scheduled permissions syncs"
                            );
                            let mut guard = report.write().await;
                            *guard = Some(schedule);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to schedule permissions syncs");
                        }
                    }
                })
            }
        )
        .map_err(|e| PermsSyncError::Scheduler(e.to_string()))?;

        scheduler
            .add(job)
            .await
            .map_err(|e| PermsSyncError::Scheduler(e.to_string()))?;

        Ok(Self {
            scheduler,
            syncer,
            config: config.clone(),
            last_report
        })
    }

    pub async fn start(&self) -> PermsSyncResult<()> {
        self.scheduler
            .start()
            .await
            .map_err(|e| PermsSyncError::Scheduler(e.to_string()))?;
        info!(
            interval_seconds = self.config.interval_seconds,
            "Permissions sync scheduler started"
        );
        Ok(())
    }

    pub async fn stop(&mut self) -> PermsSyncResult<()> {
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| PermsSyncError::Scheduler(e.to_string()))?;
        info!("Permissions sync scheduler stopped");
        Ok(())
    }

    pub async fn run_now(&self) -> PermsSyncResult<ScheduleReport> {
        let report = schedule_once(&self.syncer, &self.config).await?;
        let mut guard = self.last_report.write().await;
        *guard = Some(report.clone());
        Ok(report)
    }

    pub async fn last_report(&self) -> Option<ScheduleReport> {
        self.last_report.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syncer::Stores;
    use authz::{AuthzSnapshot, ExternalRepoSpec, ProviderSet, Repo, User, UserPermissions};
    use config::SyncerConfig;
    use std::collections::BTreeMap;
    use storage::{MemoryStore, PermsOps};

    fn user(id: i32) -> User {
        User {
            id,
            username: format!("user{id}"),
            site_admin: false,
            created_at: Utc::now()
        }
    }

    fn private_repo(id: i32) -> Repo {
        Repo {
            id,
            name: format!("github.com/org/repo{id}"),
            private: true,
            external_repo: ExternalRepoSpec {
                id: format!("R{id}"),
                service_type: "github".to_string(),
                service_id: "https://github.com/".to_string()
            },
            sources: BTreeMap::new()
        }
    }

    #[tokio::test]
    async fn test_schedule_once_prioritizes_never_synced() {
        let store = MemoryStore::new();
        store.insert_user(user(1));
        store.insert_user(user(2));
        store.insert_repo(private_repo(10));
        store
            .set_user_permissions(&UserPermissions::new(2, []))
            .await
            .unwrap();

        let syncer = PermsSyncer::new(
            Stores::from_backend(store.clone()),
            Arc::new(AuthzSnapshot::new(true, ProviderSet::default())),
            &SyncerConfig::default()
        );
        let config = SchedulerConfig {
            min_stale_age_seconds: 0,
            ..SchedulerConfig::default()
        };

        let report = schedule_once(&syncer, &config).await.unwrap();
        assert_eq!(report.users_with_no_perms, 1);
        assert_eq!(report.repos_with_no_perms, 1);
        assert_eq!(report.stale_users, 1);
        assert_eq!(syncer.queue().len(), 3);

        let first = syncer.queue().acquire_next().unwrap();
        assert_eq!(first.meta.priority, Priority::High);
        assert_eq!(first.meta.request_type, RequestType::User);
        assert_eq!(first.meta.id, 1);
        assert!(first.meta.no_perms);

        let second = syncer.queue().acquire_next().unwrap();
        assert_eq!(second.meta.request_type, RequestType::Repo);

        let third = syncer.queue().acquire_next().unwrap();
        assert_eq!(third.meta.priority, Priority::Low);
        assert_eq!(third.meta.id, 2);
    }

    #[tokio::test]
    async fn test_scheduler_run_now_records_report() {
        let store = MemoryStore::new();
        let syncer = Arc::new(PermsSyncer::new(
            Stores::from_backend(store),
            Arc::new(AuthzSnapshot::new(true, ProviderSet::default())),
            &SyncerConfig::default()
        ));
        let scheduler = PermsScheduler::new(syncer, &SchedulerConfig::default())
            .await
            .unwrap();
        assert!(scheduler.last_report().await.is_none());

        let report = scheduler.run_now().await.unwrap();
        assert_eq!(report, ScheduleReport::default());
        assert_eq!(scheduler.last_report().await, Some(report));
    }
}

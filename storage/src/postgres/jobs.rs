use super::PostgresStore;
use crate::error::{StoreError, StoreResult};
use crate::jobs::{NewSyncJob, PermissionSyncJob, SyncJobPriority, SyncJobState};
use crate::traits::SyncJobStore;
use async_trait::async_trait;
use authz::CodeHostStatusesSet;
use chrono::Utc;
use sqlx::Row;
use sqlx::postgres::PgRow;
use std::str::FromStr;
use std::time::Duration;

const JOB_COLUMNS: &str = "id, state, user_id, repository_id, priority, invalidate_caches, reason, \
     failure_message, num_resets, num_failures, queued_at, started_at, finished_at, \
     last_heartbeat_at, worker_hostname, code_host_states";

fn job_from_row(row: &PgRow) -> StoreResult<PermissionSyncJob> {
    let state: String = row.try_get("state")?;
    let state = SyncJobState::from_str(&state)
        .map_err(|e| StoreError::InvalidData(format!("job state {state}: {e}")))?;
    let code_host_states: Option<serde_json::Value> = row.try_get("code_host_states")?;
    let code_host_states = code_host_states
        .map(serde_json::from_value::<CodeHostStatusesSet>)
        .transpose()?;

    Ok(PermissionSyncJob {
        id: row.try_get("id")?,
        state,
        user_id: row.try_get("user_id")?,
        repository_id: row.try_get("repository_id")?,
        priority: SyncJobPriority::from_weight(row.try_get("priority")?),
        invalidate_caches: row.try_get("invalidate_caches")?,
        reason: row.try_get("reason")?,
        failure_message: row.try_get("failure_message")?,
        num_resets: row.try_get("num_resets")?,
        num_failures: row.try_get("num_failures")?,
        queued_at: row.try_get("queued_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        worker_hostname: row.try_get("worker_hostname")?,
        code_host_states
    })
}

#[async_trait]
impl SyncJobStore for PostgresStore {
    async fn create(&self, job: &NewSyncJob) -> StoreResult<i64> {
        if !job.is_valid() {
            return Err(StoreError::InvalidData(
                "exactly one of user_id and repository_id must be set".to_string()
            ));
        }
        let id = sqlx::query_scalar(
            "INSERT INTO permission_sync_jobs
                 (state, user_id, repository_id, priority, invalidate_caches, reason, queued_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id"
        )
        .bind(SyncJobState::Queued.to_string())
        .bind(job.user_id)
        .bind(job.repository_id)
        .bind(job.priority.weight())
        .bind(job.invalidate_caches)
        .bind(&job.reason)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get(&self, id: i64) -> StoreResult<Option<PermissionSyncJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM permission_sync_jobs WHERE id = $1");
        let row = sqlx::query(sqlx::AssertSqlSafe(sql.as_str()))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn dequeue(&self, worker_hostname: &str) -> StoreResult<Option<PermissionSyncJob>> {
        let sql = format!(
            "UPDATE permission_sync_jobs
             SET state = 'processing', started_at = $2, last_heartbeat_at = $2, worker_hostname = $1
             WHERE id = (
                 SELECT id FROM permission_sync_jobs
                 WHERE state = 'queued'
                 ORDER BY priority DESC, queued_at ASC, id ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(sqlx::AssertSqlSafe(sql.as_str()))
            .bind(worker_hostname)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn heartbeat(&self, ids: &[i64]) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "UPDATE permission_sync_jobs SET last_heartbeat_at = $1
             WHERE id = ANY($2) AND state = 'processing'"
        )
        .bind(Utc::now())
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_complete(&self, id: i64, statuses: &CodeHostStatusesSet) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE permission_sync_jobs
             SET state = 'completed', finished_at = $2, code_host_states = $3
             WHERE id = $1"
        )
        .bind(id)
        .bind(Utc::now())
        .bind(serde_json::to_value(statuses)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("permission sync job", id));
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        message: &str,
        statuses: &CodeHostStatusesSet
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE permission_sync_jobs
             SET state = 'failed', finished_at = $2, failure_message = $3,
                 num_failures = num_failures + 1, code_host_states = $4
             WHERE id = $1"
        )
        .bind(id)
        .bind(Utc::now())
        .bind(message)
        .bind(serde_json::to_value(statuses)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("permission sync job", id));
        }
        Ok(())
    }

    async fn reset_stalled(
        &self,
        stall_after: Duration,
        max_resets: i32
    ) -> StoreResult<(Vec<i64>, Vec<i64>)> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(stall_after).unwrap_or_else(|_| chrono::Duration::zero());
        let mut tx = self.pool.begin().await?;

        let reset: Vec<i64> = sqlx::query_scalar(
            "UPDATE permission_sync_jobs
             SET state = 'queued', num_resets = num_resets + 1,
                 started_at = NULL, last_heartbeat_at = NULL, worker_hostname = NULL
             WHERE state = 'processing'
               AND (last_heartbeat_at IS NULL OR last_heartbeat_at <= $1)
               AND num_resets < $2
             RETURNING id"
        )
        .bind(cutoff)
        .bind(max_resets)
        .fetch_all(&mut *tx)
        .await?;

        let failed: Vec<i64> = sqlx::query_scalar(
            "UPDATE permission_sync_jobs
             SET state = 'failed', finished_at = $3, failure_message = 'failed to process'
             WHERE state = 'processing'
               AND (last_heartbeat_at IS NULL OR last_heartbeat_at <= $1)
               AND num_resets >= $2
             RETURNING id"
        )
        .bind(cutoff)
        .bind(max_resets)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((reset, failed))
    }
}

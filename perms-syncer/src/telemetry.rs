use metrics::{counter, gauge, histogram};
use std::time::Instant;

use crate::queue::RequestType;

pub struct Telemetry;

impl Telemetry {
    pub fn set_queue_size(size: usize) {
        gauge!("perms_syncer_queue_size").set(size as f64);
    }

    pub fn record_queue_update(request_type: RequestType) {
        counter!("perms_syncer_queue_updates_total", "type" => request_type.to_string())
            .increment(1);
    }

    pub fn record_sync(request_type: RequestType, success: bool, duration_secs: f64) {
        histogram!(
            "perms_syncer_sync_duration_seconds",
            "type" => request_type.to_string(),
            "success" => success.to_string()
        )
        .record(duration_secs);
    }

    pub fn record_sync_error(request_type: RequestType, reason: &str) {
        counter!(
            "perms_syncer_sync_errors_total",
            "type" => request_type.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    pub fn record_first_sync_failure(request_type: RequestType) {
        counter!("perms_syncer_first_sync_failures_total", "type" => request_type.to_string())
            .increment(1);
    }

    pub fn record_account_expired(service_type: &str) {
        counter!("perms_syncer_accounts_expired_total", "service_type" => service_type.to_string())
            .increment(1);
    }

    pub fn set_no_perms(request_type: RequestType, count: usize) {
        gauge!("perms_syncer_no_perms", "type" => request_type.to_string()).set(count as f64);
    }

    pub fn set_stale_perms(request_type: RequestType, count: usize) {
        gauge!("perms_syncer_stale_perms", "type" => request_type.to_string()).set(count as f64);
    }

    pub fn record_jobs_reset(reset: usize, failed: usize) {
        counter!("perms_syncer_jobs_reset_total").increment(reset as u64);
        counter!("perms_syncer_jobs_reset_failures_total").increment(failed as u64);
    }
}

/// Records the sync duration histogram when finished.
pub struct SyncTimer {
    start: Instant,
    request_type: RequestType
}

impl SyncTimer {
    pub fn new(request_type: RequestType) -> Self {
        Self {
            start: Instant::now(),
            request_type
        }
    }

    pub fn finish(self, success: bool) {
        Telemetry::record_sync(self.request_type, success, self.start.elapsed().as_secs_f64());
    }
}

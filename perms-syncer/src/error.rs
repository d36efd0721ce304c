use errors::ProviderError;
use storage::StoreError;
use thiserror::Error;

pub type PermsSyncResult<T> = Result<T, PermsSyncError>;

#[derive(Debug, Error)]
pub enum PermsSyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{request_type} concurrency pool closed")]
    PoolClosed { request_type: &'static str },

    #[error("Server error: {0}")]
    Server(String)
}

impl PermsSyncError {
    /// Short, low-cardinality label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Store(_) => "store",
            Self::Provider(e) => e.reason(),
            Self::Config(_) => "config",
            Self::Scheduler(_) => "scheduler",
            Self::InvalidRequest(_) => "invalid_request",
            Self::PoolClosed { .. } => "pool_closed",
            Self::Server(_) => "server"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_labels() {
        let err: PermsSyncError = StoreError::TransactionClosed.into();
        assert_eq!(err.reason(), "store");

        let err: PermsSyncError = ProviderError::timeout("deadline exceeded").into();
        assert_eq!(err.reason(), "timeout");
        assert!(err.to_string().starts_with("Provider error: Timeout"));

        let err = PermsSyncError::InvalidRequest("unknown request type".to_string());
        assert_eq!(err.to_string(), "Invalid request: unknown request type");
    }
}

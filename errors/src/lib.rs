//! # Permissions Sync Errors
//!
//! Error taxonomy shared by code-host providers and the permissions syncer.
//!
//! Follows Microsoft Pragmatic Rust Guidelines:
//! - Uses `thiserror` for structured error definitions
//! - Provides `Display` and `Error` trait implementations
//! - Classifies failures so callers can decide between expiring an account,
//!   preserving prior state, or giving up on a single provider

use thiserror::Error;

/// Errors returned by a code-host provider while fetching accounts or
/// permissions.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    #[error("Account suspended: {message}")]
    AccountSuspended { message: String },

    #[error("Rate limited: retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("Timeout: {message}")]
    Timeout { message: String },

    #[error("Network error: {reason}")]
    Network { reason: String },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Not implemented: {operation}")]
    NotImplemented { operation: String },

    #[error("Code host API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {reason}")]
    InvalidResponse { reason: String }
}

impl ProviderError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into()
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into()
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into()
        }
    }

    pub fn not_implemented(operation: impl Into<String>) -> Self {
        Self::NotImplemented {
            operation: operation.into()
        }
    }

    /// Maps a non-success HTTP status and response body onto the taxonomy.
    ///
    /// A 403 whose body mentions a suspension is reported as
    /// [`ProviderError::AccountSuspended`].
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let message = body.into();
        match status {
            401 => Self::Unauthorized { message },
            403 if message.to_lowercase().contains("suspended") => {
                Self::AccountSuspended { message }
            }
            403 => Self::Forbidden { message },
            404 => Self::NotFound { resource: message },
            408 | 504 => Self::Timeout { message },
            429 => Self::RateLimited { retry_after: 60 },
            _ => Self::Api { status, message }
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden { .. })
    }

    pub fn is_account_suspended(&self) -> bool {
        matches!(self, Self::AccountSuspended { .. })
    }

    /// The credentials behind the account can no longer be used; the account
    /// must be marked expired until the user re-authenticates.
    pub fn invalidates_account(&self) -> bool {
        self.is_unauthorized() || self.is_forbidden() || self.is_account_suspended()
    }

    /// The failure is expected to clear on its own (rate limit, timeout,
    /// network blip, code host 5xx).
    pub fn is_temporary(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout { .. } | Self::Network { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false
        }
    }

    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Self::NotImplemented { .. })
    }

    pub fn retry_after(&self) -> Option<u64> {
        if let Self::RateLimited { retry_after } = self {
            Some(*retry_after)
        } else {
            None
        }
    }

    /// Short, low-cardinality label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "unauthorized",
            Self::Forbidden { .. } => "forbidden",
            Self::AccountSuspended { .. } => "account_suspended",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout { .. } => "timeout",
            Self::Network { .. } => "network",
            Self::NotFound { .. } => "not_found",
            Self::NotImplemented { .. } => "not_implemented",
            Self::Api { .. } => "api",
            Self::InvalidResponse { .. } => "invalid_response"
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_classification() {
        assert!(ProviderError::from_status(401, "bad credentials").is_unauthorized());
        assert!(ProviderError::from_status(403, "nope").is_forbidden());
        assert!(
            ProviderError::from_status(403, "Sorry. Your account was suspended.")
                .is_account_suspended()
        );
        assert!(ProviderError::from_status(502, "bad gateway").is_temporary());
        assert!(!ProviderError::from_status(422, "unprocessable").is_temporary());
    }

    #[test]
    fn test_account_invalidation() {
        assert!(ProviderError::unauthorized("x").invalidates_account());
        assert!(ProviderError::forbidden("x").invalidates_account());
        assert!(!ProviderError::timeout("deadline exceeded").invalidates_account());
    }

    #[test]
    fn test_temporary_errors() {
        let rate_limited = ProviderError::RateLimited { retry_after: 30 };
        assert!(rate_limited.is_temporary());
        assert_eq!(rate_limited.retry_after(), Some(30));

        let timeout = ProviderError::timeout("context deadline exceeded");
        assert!(timeout.is_temporary());
        assert_eq!(timeout.retry_after(), None);

        assert!(!ProviderError::not_implemented("fetch_repo_perms").is_temporary());
    }

    #[test]
    fn test_error_display() {
        let err = ProviderError::Api {
            status: 500,
            message: "boom".to_string()
        };
        assert_eq!(err.to_string(), "Code host API error: 500 - boom");
        assert_eq!(err.reason(), "api");
    }
}

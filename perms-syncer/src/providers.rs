//! Builds authorization providers from code-host connections.

use crate::github::GitHubProvider;
use crate::gitlab::GitLabProvider;
use crate::rate_limit::RateLimiterRegistry;
use authz::{Account, Provider, ProviderSet, ServiceKind, User};
use config::{CodeHostConfig, PermsSyncConfig};
use errors::{ProviderError, ProviderResult};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Result of turning configuration into providers.
pub struct ProviderBuild {
    pub providers: ProviderSet,
    pub allow_access_by_default: bool,
    /// Misconfigurations that disable default access. Each entry names the
    /// offending connection.
    pub problems: Vec<String>
}

/// Builds one provider per connection with `authorization` enabled.
///
/// Any problem forces `allow_access_by_default` to `false`.
pub fn build_providers(config: &PermsSyncConfig) -> ProviderBuild {
    let timeout = Duration::from_secs(config.syncer.request_timeout_seconds);
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
    let mut problems = Vec::new();
    let mut seen = HashSet::new();

    for connection in config.providers.iter().filter(|c| c.authorization) {
        let urn = connection.urn();
        if !seen.insert(urn.clone()) {
            problems.push(format!("{urn}: duplicate code host connection"));
            continue;
        }
        match build_provider(connection, timeout) {
            Ok(provider) => providers.push(provider),
            Err(problem) => problems.push(format!("{urn}: {problem}"))
        }
    }

    for problem in &problems {
        warn!(problem = %problem, "Authorization provider misconfigured");
    }
    let allow_access_by_default = config.allow_access_by_default && problems.is_empty();
    info!(
        providers = providers.len(),
        problems = problems.len(),
        allow_access_by_default,
        "Built authorization providers"
    );

    ProviderBuild {
        providers: ProviderSet::new(providers),
        allow_access_by_default,
        problems
    }
}

fn build_provider(
    connection: &CodeHostConfig,
    timeout: Duration
) -> Result<Arc<dyn Provider>, String> {
    let kind = ServiceKind::from_str(&connection.kind)
        .map_err(|_| format!("unknown code host kind {:?}", connection.kind))?;
    if connection.token.trim().is_empty() {
        return Err("missing access token".to_string());
    }

    let provider: Arc<dyn Provider> = match kind {
        ServiceKind::GitHub => {
            Arc::new(GitHubProvider::new(connection, timeout).map_err(|e| e.to_string())?)
        }
        ServiceKind::GitLab => {
            Arc::new(GitLabProvider::new(connection, timeout).map_err(|e| e.to_string())?)
        }
        ServiceKind::BitbucketServer | ServiceKind::Perforce => {
            return Err(format!("permissions from {kind} are not supported"));
        }
    };
    Ok(provider)
}

/// Default limiter plus per-connection overrides.
pub fn rate_limiters_for(config: &PermsSyncConfig) -> RateLimiterRegistry {
    config
        .providers
        .iter()
        .filter_map(|c| c.rate_limit_per_second.map(|rps| (c.urn(), rps)))
        .fold(
            RateLimiterRegistry::new(config.syncer.rate_limit_per_second),
            |registry, (urn, rps)| registry.with_override(urn, rps)
        )
}

/// Checks every provider's credentials. Returns one message per failing
/// provider.
pub async fn validate_connections(providers: &ProviderSet) -> Vec<String> {
    let mut failures = Vec::new();
    for provider in providers.iter() {
        if let Err(e) = provider.validate_connection().await {
            warn!(urn = provider.urn(), error = %e, "Code host connection check failed");
            failures.push(format!("{}: {}", provider.urn(), e));
        }
    }
    failures
}

/// `https://github.com` -> `https://github.com/`.
pub(crate) fn normalize_base_url(url: &str) -> String {
    format!("{}/", url.trim().trim_end_matches('/'))
}

/// The user's unexpired account on `provider`'s code host, if already linked.
pub(crate) fn matching_account(
    provider: &dyn Provider,
    user: &User,
    current: &[Account]
) -> Option<Account> {
    current
        .iter()
        .find(|a| {
            a.user_id == user.id
                && !a.is_expired()
                && a.spec.service_type == provider.service_type()
                && a.spec.service_id == provider.service_id()
        })
        .cloned()
}

pub(crate) fn account_token(account: &Account) -> ProviderResult<&str> {
    account
        .access_token()
        .ok_or_else(|| {
            ProviderError::unauthorized(format!("account {} has no access token", account.id))
        })
}

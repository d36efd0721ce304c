//! Provider lookup and the process-wide swappable holder.

use crate::traits::Provider;
use parking_lot::RwLock;
use std::sync::Arc;

/// An immutable set of providers, looked up by URN or by service.
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: Vec<Arc<dyn Provider>>,
}

impl ProviderSet {
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self { providers }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Provider>> {
        self.providers.iter()
    }

    pub fn by_urn(&self, urn: &str) -> Option<Arc<dyn Provider>> {
        self.providers.iter().find(|p| p.urn() == urn).cloned()
    }

    /// All providers talking to the given code host, in registration order.
    pub fn by_service(&self, service_type: &str, service_id: &str) -> Vec<Arc<dyn Provider>> {
        self.providers
            .iter()
            .filter(|p| p.service_type() == service_type && p.service_id() == service_id)
            .cloned()
            .collect()
    }

    pub fn by_service_id(&self, service_id: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .iter()
            .find(|p| p.service_id() == service_id)
            .cloned()
    }
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.providers.iter().map(|p| p.urn().to_string()))
            .finish()
    }
}

/// The authorization configuration in effect at a point in time.
#[derive(Debug, Clone)]
pub struct AuthzSnapshot {
    pub allow_access_by_default: bool,
    pub providers: ProviderSet,
}

impl AuthzSnapshot {
    pub fn new(allow_access_by_default: bool, providers: ProviderSet) -> Self {
        Self {
            allow_access_by_default,
            providers,
        }
    }
}

/// Source of the current authorization configuration. Core logic only sees
/// this trait; the swappable holder lives at the composition root.
pub trait ProviderSource: Send + Sync {
    fn snapshot(&self) -> AuthzSnapshot;
}

impl ProviderSource for AuthzSnapshot {
    fn snapshot(&self) -> AuthzSnapshot {
        self.clone()
    }
}

/// Thread-safe holder that can be swapped when code-host configuration
/// changes.
pub struct ProviderRegistry {
    inner: RwLock<AuthzSnapshot>,
}

impl ProviderRegistry {
    pub fn new(snapshot: AuthzSnapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
        }
    }

    pub fn set_providers(&self, allow_access_by_default: bool, providers: ProviderSet) {
        let mut guard = self.inner.write();
        *guard = AuthzSnapshot::new(allow_access_by_default, providers);
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new(AuthzSnapshot::new(true, ProviderSet::default()))
    }
}

impl ProviderSource for ProviderRegistry {
    fn snapshot(&self) -> AuthzSnapshot {
        self.inner.read().clone()
    }
}

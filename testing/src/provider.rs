use async_trait::async_trait;
use authz::{
    Account, ExternalUserPermissions, FetchPermsOptions, Provider, Repo, User, UserId,
};
use errors::{ProviderError, ProviderResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Provider whose answers are scripted by the test.
///
/// Unscripted lookups succeed with an empty result. Fetches sleep for the
/// configured delay and track how many ran concurrently.
pub struct MockProvider {
    service_type: String,
    service_id: String,
    urn: String,
    delay: Duration,
    accounts: Mutex<HashMap<UserId, Account>>,
    user_perms: Mutex<HashMap<String, ProviderResult<ExternalUserPermissions>>>,
    token_perms: Mutex<HashMap<String, ProviderResult<ExternalUserPermissions>>>,
    repo_perms: Mutex<HashMap<String, ProviderResult<Vec<String>>>>,
    fetched_accounts: Mutex<Vec<String>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize
}

impl MockProvider {
    pub fn new(service_type: &str, service_id: &str, urn: &str) -> Self {
        Self {
            service_type: service_type.to_string(),
            service_id: service_id.to_string(),
            urn: urn.to_string(),
            delay: Duration::ZERO,
            accounts: Mutex::new(HashMap::new()),
            user_perms: Mutex::new(HashMap::new()),
            token_perms: Mutex::new(HashMap::new()),
            repo_perms: Mutex::new(HashMap::new()),
            fetched_accounts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Account returned by `fetch_account` for the account's user.
    pub fn set_account(&self, account: Account) {
        self.accounts.lock().insert(account.user_id, account);
    }

    pub fn set_user_perms(
        &self,
        account_id: &str,
        result: ProviderResult<ExternalUserPermissions>
    ) {
        self.user_perms.lock().insert(account_id.to_string(), result);
    }

    pub fn set_token_perms(&self, token: &str, result: ProviderResult<ExternalUserPermissions>) {
        self.token_perms.lock().insert(token.to_string(), result);
    }

    /// Scripts `fetch_repo_perms` for the repository with the given external
    /// ID.
    pub fn set_repo_perms(&self, external_repo_id: &str, result: ProviderResult<Vec<String>>) {
        self.repo_perms
            .lock()
            .insert(external_repo_id.to_string(), result);
    }

    /// Number of permission fetches served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Account IDs passed to `fetch_user_perms`, in call order.
    pub fn fetched_accounts(&self) -> Vec<String> {
        self.fetched_accounts.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn track<T>(&self, result: T) -> T {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn service_type(&self) -> &str {
        &self.service_type
    }

    fn service_id(&self) -> &str {
        &self.service_id
    }

    fn urn(&self) -> &str {
        &self.urn
    }

    async fn validate_connection(&self) -> ProviderResult<()> {
        Ok(())
    }

    async fn fetch_account(
        &self,
        user: &User,
        _current: &[Account],
        _verified_emails: &[String]
    ) -> ProviderResult<Option<Account>> {
        Ok(self.accounts.lock().get(&user.id).cloned())
    }

    async fn fetch_user_perms(
        &self,
        account: &Account,
        _opts: &FetchPermsOptions
    ) -> ProviderResult<ExternalUserPermissions> {
        self.fetched_accounts
            .lock()
            .push(account.spec.account_id.clone());
        let result = self
            .user_perms
            .lock()
            .get(&account.spec.account_id)
            .cloned()
            .unwrap_or_else(|| Ok(ExternalUserPermissions::default()));
        self.track(result).await
    }

    async fn fetch_user_perms_by_token(
        &self,
        token: &str,
        _opts: &FetchPermsOptions
    ) -> ProviderResult<ExternalUserPermissions> {
        let result = self
            .token_perms
            .lock()
            .get(token)
            .cloned()
            .unwrap_or_else(|| Err(ProviderError::not_implemented("fetch_user_perms_by_token")));
        self.track(result).await
    }

    async fn fetch_repo_perms(
        &self,
        repo: &Repo,
        _opts: &FetchPermsOptions
    ) -> ProviderResult<Vec<String>> {
        let result = self
            .repo_perms
            .lock()
            .get(&repo.external_repo.id)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()));
        self.track(result).await
    }
}

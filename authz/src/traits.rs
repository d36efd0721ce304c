//! Core traits for the permissions sync engine

use crate::types::{Account, ExternalUserPermissions, FetchPermsOptions, Repo, User};
use async_trait::async_trait;
use errors::ProviderResult;

/// A code host that can answer authorization questions.
///
/// Implementations are identified by their URN, which is unique per
/// code-host connection. Several connections may share the same
/// `service_type`/`service_id` (for example two GitLab connections to the
/// same instance with different tokens).
#[async_trait]
pub trait Provider: Send + Sync {
    fn service_type(&self) -> &str;

    fn service_id(&self) -> &str;

    fn urn(&self) -> &str;

    async fn validate_connection(&self) -> ProviderResult<()>;

    /// Looks up the user's account on this code host. Returns `None` when the
    /// user has no matching account.
    async fn fetch_account(
        &self,
        user: &User,
        current: &[Account],
        verified_emails: &[String],
    ) -> ProviderResult<Option<Account>>;

    async fn fetch_user_perms(
        &self,
        account: &Account,
        opts: &FetchPermsOptions,
    ) -> ProviderResult<ExternalUserPermissions>;

    async fn fetch_user_perms_by_token(
        &self,
        token: &str,
        opts: &FetchPermsOptions,
    ) -> ProviderResult<ExternalUserPermissions>;

    /// Returns the code-host account IDs that can read the repository.
    async fn fetch_repo_perms(
        &self,
        repo: &Repo,
        opts: &FetchPermsOptions,
    ) -> ProviderResult<Vec<String>>;
}

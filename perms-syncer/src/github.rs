use crate::client::CodeHostClient;
use crate::providers::{account_token, matching_account, normalize_base_url};
use async_trait::async_trait;
use authz::{
    Account, ExternalUserPermissions, FetchPermsOptions, Provider, Repo, ServiceKind, User
};
use config::CodeHostConfig;
use errors::{ProviderError, ProviderResult};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const GITHUB_DOT_COM: &str = "https://github.com/";
const GITHUB_DOT_COM_API: &str = "https://api.github.com";

/// Repositories the authenticated user can read, across every affiliation.
const USER_REPOS_PATH: &str = "/user/repos?affiliation=owner,collaborator,organization_member&per_page=100";

/// Enforces GitHub repository visibility using the REST API.
///
/// External repository IDs are GraphQL node IDs; external account IDs are
/// numeric user IDs.
pub struct GitHubProvider {
    urn: String,
    service_id: String,
    token: String,
    client: CodeHostClient
}

#[derive(Debug, Deserialize)]
struct GitHubRepo {
    node_id: String
}

#[derive(Debug, Deserialize)]
struct GitHubUser {
    id: i64,
    login: String
}

impl GitHubProvider {
    pub fn new(config: &CodeHostConfig, timeout: Duration) -> ProviderResult<Self> {
        let service_id = normalize_base_url(&config.url);
        let api_url = config
            .api_url
            .clone()
            .unwrap_or_else(|| default_api_url(&service_id));

        Ok(Self {
            urn: config.urn(),
            service_id,
            token: config.token.clone(),
            client: CodeHostClient::new(&api_url, timeout)?
        })
    }

    async fn list_repos(&self, token: &str) -> ProviderResult<ExternalUserPermissions> {
        let repos: Vec<GitHubRepo> = self.client.get_all(USER_REPOS_PATH, token).await?;
        debug!(urn = %self.urn, repos = repos.len(), "Fetched GitHub user repositories");
        Ok(ExternalUserPermissions::from_exacts(
            repos.into_iter().map(|r| r.node_id)
        ))
    }
}

fn default_api_url(service_id: &str) -> String {
    if service_id == GITHUB_DOT_COM {
        GITHUB_DOT_COM_API.to_string()
    } else {
        format!("{service_id}api/v3")
    }
}

/// `github.example.com/owner/name` -> `("owner", "name")`.
fn owner_and_name(repo_name: &str) -> Option<(&str, &str)> {
    let mut segments = repo_name.trim_end_matches('/').rsplit('/');
    let name = segments.next().filter(|s| !s.is_empty())?;
    let owner = segments.next().filter(|s| !s.is_empty())?;
    Some((owner, name))
}

#[async_trait]
impl Provider for GitHubProvider {
    fn service_type(&self) -> &str {
        ServiceKind::GitHub.service_type()
    }

    fn service_id(&self) -> &str {
        &self.service_id
    }

    fn urn(&self) -> &str {
        &self.urn
    }

    async fn validate_connection(&self) -> ProviderResult<()> {
        let (user, _): (GitHubUser, _) = self.client.get("/user", &self.token).await?;
        debug!(urn = %self.urn, login = %user.login, "Validated GitHub connection");
        Ok(())
    }

    async fn fetch_account(
        &self,
        user: &User,
        current: &[Account],
        _verified_emails: &[String]
    ) -> ProviderResult<Option<Account>> {
        Ok(matching_account(self, user, current))
    }

    async fn fetch_user_perms(
        &self,
        account: &Account,
        _opts: &FetchPermsOptions
    ) -> ProviderResult<ExternalUserPermissions> {
        let token = account_token(account)?;
        self.list_repos(token).await
    }

    async fn fetch_user_perms_by_token(
        &self,
        token: &str,
        _opts: &FetchPermsOptions
    ) -> ProviderResult<ExternalUserPermissions> {
        self.list_repos(token).await
    }

    async fn fetch_repo_perms(
        &self,
        repo: &Repo,
        _opts: &FetchPermsOptions
    ) -> ProviderResult<Vec<String>> {
        let (owner, name) = owner_and_name(&repo.name).ok_or_else(|| ProviderError::NotFound {
            resource: repo.name.clone()
        })?;
        let path = format!("/repos/{owner}/{name}/collaborators?affiliation=all&per_page=100");
        let users: Vec<GitHubUser> = self.client.get_all(&path, &self.token).await?;
        Ok(users.into_iter().map(|u| u.id.to_string()).collect())
    }
}

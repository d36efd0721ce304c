use crate::client::CodeHostClient;
use crate::providers::{account_token, matching_account, normalize_base_url};
use async_trait::async_trait;
use authz::{
    Account, ExternalUserPermissions, FetchPermsOptions, Provider, Repo, ServiceKind, User
};
use config::CodeHostConfig;
use errors::ProviderResult;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Reporter. Guests cannot read code on private projects.
const MIN_ACCESS_LEVEL: u32 = 20;

/// Enforces GitLab project visibility using the v4 REST API.
///
/// External repository IDs are numeric project IDs; external account IDs
/// are numeric user IDs.
pub struct GitLabProvider {
    urn: String,
    service_id: String,
    token: String,
    client: CodeHostClient
}

#[derive(Debug, Deserialize)]
struct GitLabProject {
    id: i64
}

#[derive(Debug, Deserialize)]
struct GitLabMember {
    id: i64,
    access_level: u32
}

#[derive(Debug, Deserialize)]
struct GitLabUser {
    username: String
}

impl GitLabProvider {
    pub fn new(config: &CodeHostConfig, timeout: Duration) -> ProviderResult<Self> {
        let service_id = normalize_base_url(&config.url);
        let api_url = config
            .api_url
            .clone()
            .unwrap_or_else(|| format!("{service_id}api/v4"));

        Ok(Self {
            urn: config.urn(),
            service_id,
            token: config.token.clone(),
            client: CodeHostClient::new(&api_url, timeout)?
        })
    }

    async fn list_projects(&self, token: &str) -> ProviderResult<ExternalUserPermissions> {
        let path = format!("/projects?min_access_level={MIN_ACCESS_LEVEL}&per_page=100");
        let projects: Vec<GitLabProject> = self.client.get_all(&path, token).await?;
        debug!(urn = %self.urn, projects = projects.len(), "Fetched GitLab user projects");
        Ok(ExternalUserPermissions::from_exacts(
            projects.into_iter().map(|p| p.id.to_string())
        ))
    }
}

#[async_trait]
impl Provider for GitLabProvider {
    fn service_type(&self) -> &str {
        ServiceKind::GitLab.service_type()
    }

    fn service_id(&self) -> &str {
        &self.service_id
    }

    fn urn(&self) -> &str {
        &self.urn
    }

    async fn validate_connection(&self) -> ProviderResult<()> {
        let (user, _): (GitLabUser, _) = self.client.get("/user", &self.token).await?;
        debug!(urn = %self.urn, username = %user.username, "Validated GitLab connection");
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
        self.list_projects(token).await
    }

    async fn fetch_user_perms_by_token(
        &self,
        token: &str,
        _opts: &FetchPermsOptions
    ) -> ProviderResult<ExternalUserPermissions> {
        self.list_projects(token).await
    }

    async fn fetch_repo_perms(
        &self,
        repo: &Repo,
        _opts: &FetchPermsOptions
    ) -> ProviderResult<Vec<String>> {
        let path = format!(
            "/projects/{}/members/all?per_page=100",
            repo.external_repo.id
        );
        let members: Vec<GitLabMember> = self.client.get_all(&path, &self.token).await?;
        Ok(members
            .into_iter()
            .filter(|m| m.access_level >= MIN_ACCESS_LEVEL)
            .map(|m| m.id.to_string())
            .collect())
    }
}

use chrono::{DateTime, Utc};
use errors::ProviderError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use strum::{Display, EnumString};

pub type UserId = i32;
pub type RepoId = i32;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Perms {
    None,
    #[default]
    Read,
    Write,
    Admin,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PermType {
    #[default]
    Repos,
}

/// Closed set of code hosts that can act as authorization providers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ServiceKind {
    #[serde(rename = "github")]
    #[strum(serialize = "github")]
    GitHub,
    #[serde(rename = "gitlab")]
    #[strum(serialize = "gitlab")]
    GitLab,
    BitbucketServer,
    Perforce,
}

impl ServiceKind {
    pub fn service_type(&self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::GitLab => "gitlab",
            Self::BitbucketServer => "bitbucketServer",
            Self::Perforce => "perforce",
        }
    }
}

/// Repositories a user may access, plus the bookkeeping timestamps used by
/// the scheduler to find stale rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPermissions {
    pub user_id: UserId,
    pub perm: Perms,
    pub perm_type: PermType,
    pub ids: BTreeSet<RepoId>,
    pub updated_at: Option<DateTime<Utc>>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl UserPermissions {
    pub fn new(user_id: UserId, ids: impl IntoIterator<Item = RepoId>) -> Self {
        Self {
            user_id,
            perm: Perms::Read,
            perm_type: PermType::Repos,
            ids: ids.into_iter().collect(),
            updated_at: None,
            synced_at: None,
        }
    }

    pub fn sorted_ids(&self) -> Vec<RepoId> {
        self.ids.iter().copied().collect()
    }
}

/// Users that may access a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoPermissions {
    pub repo_id: RepoId,
    pub perm: Perms,
    pub user_ids: BTreeSet<UserId>,
    pub updated_at: Option<DateTime<Utc>>,
    pub synced_at: Option<DateTime<Utc>>,
    pub unrestricted: bool,
}

impl RepoPermissions {
    pub fn new(repo_id: RepoId, user_ids: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            repo_id,
            perm: Perms::Read,
            user_ids: user_ids.into_iter().collect(),
            updated_at: None,
            synced_at: None,
            unrestricted: false,
        }
    }

    pub fn sorted_user_ids(&self) -> Vec<UserId> {
        self.user_ids.iter().copied().collect()
    }
}

/// Grants recorded for an external account that is not yet linked to a
/// local user. `bind_id` is the account ID on the code host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPendingPermissions {
    pub id: i64,
    pub service_type: String,
    pub service_id: String,
    pub bind_id: String,
    pub perm: Perms,
    pub perm_type: PermType,
    pub ids: BTreeSet<RepoId>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Path-level allow/deny rules inside a single repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubRepoPermissions {
    pub path_includes: Vec<String>,
    pub path_excludes: Vec<String>,
}

/// What a code host reports a user can see.
///
/// Providers pick exactly one strategy: either `exacts` (explicit external
/// repository IDs) or the `include_contains`/`exclude_contains` prefix
/// lists used by path-oriented hosts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalUserPermissions {
    pub exacts: Vec<String>,
    pub include_contains: Vec<String>,
    pub exclude_contains: Vec<String>,
    pub sub_repo_permissions: HashMap<String, SubRepoPermissions>,
}

impl ExternalUserPermissions {
    pub fn from_exacts(exacts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            exacts: exacts.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn uses_prefixes(&self) -> bool {
        !self.include_contains.is_empty() || !self.exclude_contains.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.exacts.is_empty() && !self.uses_prefixes()
    }

    pub fn validate(&self) -> Result<(), ProviderError> {
        if !self.exacts.is_empty() && self.uses_prefixes() {
            return Err(ProviderError::InvalidResponse {
                reason: "exacts and include/exclude prefixes are mutually exclusive".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct AccountSpec {
    pub service_type: String,
    pub service_id: String,
    pub client_id: String,
    pub account_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountData {
    pub auth_data: Option<serde_json::Value>,
    pub data: Option<serde_json::Value>,
}

/// An external account on a code host, linked to a local user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub user_id: UserId,
    pub spec: AccountSpec,
    pub data: AccountData,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
    pub last_valid_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn new(user_id: UserId, spec: AccountSpec) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            user_id,
            spec,
            data: AccountData::default(),
            created_at: now,
            updated_at: now,
            expired_at: None,
            last_valid_at: None,
        }
    }

    pub fn with_access_token(mut self, token: &str) -> Self {
        self.data.auth_data = Some(serde_json::json!({ "access_token": token }));
        self
    }

    pub fn access_token(&self) -> Option<&str> {
        self.data
            .auth_data
            .as_ref()
            .and_then(|v| v.get("access_token"))
            .and_then(|v| v.as_str())
    }

    pub fn is_expired(&self) -> bool {
        self.expired_at.is_some()
    }
}

/// A batch of account IDs on a single code host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accounts {
    pub service_type: String,
    pub service_id: String,
    pub account_ids: Vec<String>,
}

impl Accounts {
    pub fn is_empty(&self) -> bool {
        self.account_ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub site_admin: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalRepoSpec {
    pub id: String,
    pub service_type: String,
    pub service_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    pub id: RepoId,
    pub name: String,
    pub private: bool,
    pub external_repo: ExternalRepoSpec,
    /// Code-host connections this repository was discovered through, keyed
    /// by provider URN.
    pub sources: BTreeMap<String, String>,
}

impl Repo {
    pub fn has_source(&self, urn: &str) -> bool {
        self.sources.contains_key(urn)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchPermsOptions {
    pub invalidate_caches: bool,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum CodeHostState {
    Success,
    Error,
}

/// Outcome of talking to one provider during a sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeHostStatus {
    pub provider_id: String,
    pub provider_type: String,
    pub status: CodeHostState,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeHostStatusesSet(Vec<CodeHostStatus>);

impl CodeHostStatusesSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_success(&mut self, provider_id: &str, provider_type: &str) {
        self.0.push(CodeHostStatus {
            provider_id: provider_id.to_string(),
            provider_type: provider_type.to_string(),
            status: CodeHostState::Success,
            message: String::new(),
        });
    }

    pub fn push_error(&mut self, provider_id: &str, provider_type: &str, message: impl ToString) {
        self.0.push(CodeHostStatus {
            provider_id: provider_id.to_string(),
            provider_type: provider_type.to_string(),
            status: CodeHostState::Error,
            message: message.to_string(),
        });
    }

    pub fn extend(&mut self, other: CodeHostStatusesSet) {
        self.0.extend(other.0);
    }

    /// Returns `(succeeded, failed)`.
    pub fn count_statuses(&self) -> (usize, usize) {
        let failed = self
            .0
            .iter()
            .filter(|s| s.status == CodeHostState::Error)
            .count();
        (self.0.len() - failed, failed)
    }

    pub fn has_errors(&self) -> bool {
        self.0.iter().any(|s| s.status == CodeHostState::Error)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CodeHostStatus> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_kind_strings() {
        assert_eq!(ServiceKind::GitHub.to_string(), "github");
        assert_eq!(ServiceKind::BitbucketServer.to_string(), "bitbucketServer");
        assert_eq!("gitlab".parse::<ServiceKind>().unwrap(), ServiceKind::GitLab);
        assert_eq!(
            serde_json::to_string(&ServiceKind::Perforce).unwrap(),
            "\"perforce\""
        );
    }

    #[test]
    fn test_external_perms_strategy_exclusive() {
        let exacts = ExternalUserPermissions::from_exacts(["1", "2"]);
        assert!(exacts.validate().is_ok());

        let mixed = ExternalUserPermissions {
            exacts: vec!["1".to_string()],
            include_contains: vec!["//depot/".to_string()],
            ..Default::default()
        };
        assert!(mixed.validate().is_err());
        assert!(ExternalUserPermissions::default().is_empty());
    }

    #[test]
    fn test_code_host_statuses() {
        let mut statuses = CodeHostStatusesSet::new();
        statuses.push_success("https://github.com/", "github");
        statuses.push_error("https://gitlab.com/", "gitlab", "boom");
        assert_eq!(statuses.count_statuses(), (1, 1));
        assert!(statuses.has_errors());

        let json = serde_json::to_string(&statuses).unwrap();
        assert!(json.starts_with('['));
        assert!(json.contains("\"ERROR\""));
    }

    #[test]
    fn test_account_access_token() {
        let spec = AccountSpec {
            service_type: "github".to_string(),
            service_id: "https://github.com/".to_string(),
            client_id: String::new(),
            account_id: "42".to_string(),
        };
        let account = Account::new(1, spec).with_access_token("tok");
        assert_eq!(account.access_token(), Some("tok"));
        assert!(!account.is_expired());
    }
}

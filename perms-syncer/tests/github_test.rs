use authz::{Account, AccountSpec, ExternalRepoSpec, Provider, Repo, User};
use chrono::Utc;
use config::CodeHostConfig;
use perms_syncer::GitHubProvider;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer) -> GitHubProvider {
    let config = CodeHostConfig {
        kind: "github".to_string(),
        id: "1".to_string(),
        url: "https://ghe.example.com".to_string(),
        api_url: Some(server.uri()),
        token: "conn-token".to_string(),
        authorization: true,
        rate_limit_per_second: None
    };
    GitHubProvider::new(&config, Duration::from_secs(5)).unwrap()
}

fn account(token: Option<&str>) -> Account {
    let account = Account::new(
        1,
        AccountSpec {
            service_type: "github".to_string(),
            service_id: "https://ghe.example.com/".to_string(),
            client_id: String::new(),
            account_id: "42".to_string()
        }
    );
    match token {
        Some(token) => account.with_access_token(token),
        None => account
    }
}

#[tokio::test]
async fn test_identity() {
    let server = MockServer::start().await;
    let github = provider(&server);
    assert_eq!(github.service_type(), "github");
    assert_eq!(github.service_id(), "https://ghe.example.com/");
    assert_eq!(github.urn(), "extsvc:github:1");
}

#[tokio::test]
async fn test_fetch_user_perms_follows_pagination() {
    let server = MockServer::start().await;
    let next = format!("<{}/user/repos?page=2>; rel=\"next\"", server.uri());

    Mock::given(method("GET"))
        .and(path("/user/repos"))
        .and(query_param_is_missing("page"))
        .and(header("Authorization", "Bearer user-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("link", next.as_str())
                .set_body_json(json!([{ "node_id": "MDEw1" }, { "node_id": "MDEw2" }]))
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/user/repos"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "node_id": "MDEw3" }])))
        .mount(&server)
        .await;

    let perms = provider(&server)
        .fetch_user_perms(&account(Some("user-token")), &Default::default())
        .await
        .unwrap();
    assert_eq!(perms.exacts, vec!["MDEw1", "MDEw2", "MDEw3"]);
    assert!(!perms.uses_prefixes());
}

#[tokio::test]
async fn test_fetch_user_perms_without_token_is_unauthorized() {
    let server = MockServer::start().await;
    let err = provider(&server)
        .fetch_user_perms(&account(None), &Default::default())
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_error_classification() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user/repos"))
        .and(header("Authorization", "Bearer revoked"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Bad credentials"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/user/repos"))
        .and(header("Authorization", "Bearer suspended"))
        .respond_with(ResponseTemplate::new(403).set_body_string("Sorry. Your account was suspended."))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/user/repos"))
        .and(header("Authorization", "Bearer busy"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
        .mount(&server)
        .await;

    let github = provider(&server);
    let opts = Default::default();

    let err = github
        .fetch_user_perms(&account(Some("revoked")), &opts)
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());

    let err = github
        .fetch_user_perms(&account(Some("suspended")), &opts)
        .await
        .unwrap_err();
    assert!(err.is_account_suspended());
    assert!(err.invalidates_account());

    let err = github
        .fetch_user_perms_by_token("busy", &opts)
        .await
        .unwrap_err();
    assert_eq!(err.retry_after(), Some(7));
    assert!(err.is_temporary());
}

#[tokio::test]
async fn test_fetch_repo_perms_lists_collaborators() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/collaborators"))
        .and(query_param("affiliation", "all"))
        .and(header("Authorization", "Bearer conn-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": 42, "login": "alice" },
            { "id": 43, "login": "bob" }
        ])))
        .mount(&server)
        .await;

    let repo = Repo {
        id: 10,
        name: "ghe.example.com/acme/widgets".to_string(),
        private: true,
        external_repo: ExternalRepoSpec {
            id: "MDEw1".to_string(),
            service_type: "github".to_string(),
            service_id: "https://ghe.example.com/".to_string()
        },
        sources: BTreeMap::new()
    };
    let account_ids = provider(&server)
        .fetch_repo_perms(&repo, &Default::default())
        .await
        .unwrap();
    assert_eq!(account_ids, vec!["42", "43"]);
}

#[tokio::test]
async fn test_validate_connection_and_fetch_account() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user"))
        .and(header("Authorization", "Bearer conn-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 1, "login": "admin" })))
        .mount(&server)
        .await;

    let github = provider(&server);
    assert!(github.validate_connection().await.is_ok());

    let user = User {
        id: 1,
        username: "alice".to_string(),
        site_admin: false,
        created_at: Utc::now()
    };
    let linked = account(Some("user-token"));
    let found = github
        .fetch_account(&user, std::slice::from_ref(&linked), &[])
        .await
        .unwrap();
    assert_eq!(found, Some(linked));

    let none = github.fetch_account(&user, &[], &[]).await.unwrap();
    assert!(none.is_none());
}

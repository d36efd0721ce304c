//! Integration tests for the PostgreSQL stores
//!
//! These tests use the shared testcontainers fixture and are skipped when
//! Docker is not available.

use authz::{Account, AccountSpec, Accounts, ExternalRepoSpec, Repo, RepoPermissions, SubRepoPermissions, UserPermissions};
use serial_test::serial;
use std::collections::BTreeMap;
use std::time::Duration;
use storage::{
    ExternalAccountStore, NewSyncJob, PermsOps, PermsStore, PostgresStore, SyncJobPriority,
    SyncJobState, SyncJobStore,
};

async fn setup() -> Option<PostgresStore> {
    let Some(fixture) = testing::postgres().await else {
        eprintln!("Skipping PostgreSQL test: Docker not available");
        return None;
    };
    let store = PostgresStore::new(fixture.url()).await.unwrap();
    store.initialize_schema().await.unwrap();
    Some(store)
}

fn repo(name: &str, private: bool) -> Repo {
    Repo {
        id: 0,
        name: name.to_string(),
        private,
        external_repo: ExternalRepoSpec {
            id: testing::unique_id("R"),
            service_type: "github".to_string(),
            service_id: "https://github.com/".to_string()
        },
        sources: BTreeMap::new()
    }
}

#[tokio::test]
#[serial]
async fn test_initialize_schema_is_idempotent() {
    let Some(store) = setup().await else { return };
    assert!(store.initialize_schema().await.is_ok());
}

#[tokio::test]
#[serial]
async fn test_set_user_permissions_keeps_both_views_consistent() {
    let Some(store) = setup().await else { return };
    let user = store
        .insert_user(&testing::unique_id("alice"), false)
        .await
        .unwrap();
    let r1 = store.insert_repo(&repo(&testing::unique_id("repo"), true)).await.unwrap();
    let r2 = store.insert_repo(&repo(&testing::unique_id("repo"), true)).await.unwrap();

    let diff = store
        .set_user_permissions(&UserPermissions::new(user.id, [r1.id, r2.id]))
        .await
        .unwrap();
    assert_eq!(diff.added, 2);

    let diff = store
        .set_user_permissions(&UserPermissions::new(user.id, [r2.id]))
        .await
        .unwrap();
    assert_eq!((diff.added, diff.removed, diff.found), (0, 1, 1));

    let repo1 = store.load_repo_permissions(r1.id).await.unwrap().unwrap();
    assert!(!repo1.user_ids.contains(&user.id));
    let repo2 = store.load_repo_permissions(r2.id).await.unwrap().unwrap();
    assert!(repo2.user_ids.contains(&user.id));

    let perms = store.load_user_permissions(user.id).await.unwrap().unwrap();
    assert_eq!(perms.sorted_ids(), vec![r2.id]);
    assert!(perms.synced_at.is_some());
}

#[tokio::test]
#[serial]
async fn test_transaction_rolls_back_on_drop() {
    let Some(store) = setup().await else { return };
    let r = store.insert_repo(&repo(&testing::unique_id("repo"), true)).await.unwrap();

    {
        let tx = store.transact().await.unwrap();
        tx.set_repo_permissions(&RepoPermissions::new(r.id, [1, 2]))
            .await
            .unwrap();
    }
    assert!(store.load_repo_permissions(r.id).await.unwrap().is_none());

    let tx = store.transact().await.unwrap();
    tx.set_repo_permissions(&RepoPermissions::new(r.id, [1, 2]))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    let perms = store.load_repo_permissions(r.id).await.unwrap().unwrap();
    assert_eq!(perms.sorted_user_ids(), vec![1, 2]);
}

#[tokio::test]
#[serial]
async fn test_pending_permissions_are_granted_on_link() {
    let Some(store) = setup().await else { return };
    let user = store
        .insert_user(&testing::unique_id("bob"), false)
        .await
        .unwrap();
    let r = store.insert_repo(&repo(&testing::unique_id("repo"), true)).await.unwrap();
    let bind_id = testing::unique_id("gh-account");

    let accounts = Accounts {
        service_type: "github".to_string(),
        service_id: "https://github.com/".to_string(),
        account_ids: vec![bind_id.clone()]
    };
    store
        .set_repo_pending_permissions(&accounts, &RepoPermissions::new(r.id, []))
        .await
        .unwrap();

    let spec = AccountSpec {
        service_type: "github".to_string(),
        service_id: "https://github.com/".to_string(),
        client_id: String::new(),
        account_id: bind_id
    };
    let pending = store.load_user_pending_permissions(&spec).await.unwrap().unwrap();
    assert!(pending.ids.contains(&r.id));

    let granted = store.grant_pending_permissions(user.id, &spec).await.unwrap();
    assert_eq!(granted, 1);
    let perms = store.load_user_permissions(user.id).await.unwrap().unwrap();
    assert!(perms.ids.contains(&r.id));
    assert!(store.load_user_pending_permissions(&spec).await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn test_sub_repo_permissions_round_trip() {
    let Some(store) = setup().await else { return };
    let perms = SubRepoPermissions {
        path_includes: vec!["/src/".to_string()],
        path_excludes: vec!["/src/secret/".to_string()]
    };
    store.set_sub_repo_permissions(7, 9, &perms).await.unwrap();
    assert_eq!(
        store.load_sub_repo_permissions(7, 9).await.unwrap(),
        Some(perms.clone())
    );

    store.set_sub_repo_permissions(7, 10, &perms).await.unwrap();
    assert!(store.retain_sub_repo_permissions(7, &[10]).await.unwrap() >= 1);
    assert!(store.load_sub_repo_permissions(7, 9).await.unwrap().is_none());
    assert_eq!(
        store.load_sub_repo_permissions(7, 10).await.unwrap(),
        Some(perms)
    );
}

#[tokio::test]
#[serial]
async fn test_external_accounts_and_user_lookup() {
    let Some(store) = setup().await else { return };
    let user = store
        .insert_user(&testing::unique_id("carol"), false)
        .await
        .unwrap();
    let account_id = testing::unique_id("42");
    let account = store
        .upsert(
            &Account::new(
                user.id,
                AccountSpec {
                    service_type: "gitlab".to_string(),
                    service_id: "https://gitlab.com/".to_string(),
                    client_id: String::new(),
                    account_id: account_id.clone()
                }
            )
            .with_access_token("secret")
        )
        .await
        .unwrap();
    assert_eq!(account.access_token(), Some("secret"));

    let ids = store
        .get_user_ids_by_external_accounts(&Accounts {
            service_type: "gitlab".to_string(),
            service_id: "https://gitlab.com/".to_string(),
            account_ids: vec![account_id.clone(), "unknown".to_string()]
        })
        .await
        .unwrap();
    assert_eq!(ids.get(&account_id), Some(&user.id));
    assert!(!ids.contains_key("unknown"));

    store.touch_expired(account.id).await.unwrap();
    let active = ExternalAccountStore::list(
        &store,
        &storage::ExternalAccountsListOptions {
            user_id: Some(user.id),
            exclude_expired: true,
            ..Default::default()
        }
    )
    .await
    .unwrap();
    assert!(active.is_empty());
}

#[tokio::test]
#[serial]
async fn test_job_queue_priority_and_reset() {
    let Some(store) = setup().await else { return };
    // Drain jobs left by earlier tests.
    while store.dequeue("drain").await.unwrap().is_some() {}

    let low = store
        .create(&NewSyncJob::user(1, SyncJobPriority::Low))
        .await
        .unwrap();
    let high = store
        .create(&NewSyncJob::repo(2, SyncJobPriority::High).with_reason("manual"))
        .await
        .unwrap();

    let job = store.dequeue("worker-1").await.unwrap().unwrap();
    assert_eq!(job.id, high);
    assert_eq!(job.reason.as_deref(), Some("manual"));
    store
        .mark_complete(high, &authz::CodeHostStatusesSet::new())
        .await
        .unwrap();

    let job = store.dequeue("worker-1").await.unwrap().unwrap();
    assert_eq!(job.id, low);
    let (reset, failed) = store.reset_stalled(Duration::ZERO, 3).await.unwrap();
    assert!(reset.contains(&low));
    assert!(failed.is_empty());
    assert_eq!(
        store.get(low).await.unwrap().unwrap().state,
        SyncJobState::Queued
    );
}

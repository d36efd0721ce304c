//! PostgreSQL-backed stores.
//!
//! Permission writes always run inside a transaction; the non-transactional
//! [`PermsOps`] methods on [`PostgresStore`] open and commit one per call.

mod jobs;
mod perms;

use crate::error::{StoreError, StoreResult};
use crate::traits::{
    ExternalAccountStore, ExternalAccountsListOptions, PermsDiff, PermsOps, PermsStore,
    PermsTransaction, RepoListOptions, RepoStore, UserStore,
};
use async_trait::async_trait;
use authz::{
    Account, AccountData, AccountSpec, Accounts, ExternalRepoSpec, Repo, RepoId, RepoPermissions,
    SubRepoPermissions, User, UserId, UserPendingPermissions, UserPermissions,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id SERIAL PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        site_admin BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        deleted_at TIMESTAMPTZ
    )",
    "CREATE TABLE IF NOT EXISTS user_emails (
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        email TEXT NOT NULL,
        verified_at TIMESTAMPTZ,
        PRIMARY KEY (user_id, email)
    )",
    "CREATE TABLE IF NOT EXISTS repo (
        id SERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        private BOOLEAN NOT NULL DEFAULT FALSE,
        external_id TEXT NOT NULL,
        external_service_type TEXT NOT NULL,
        external_service_id TEXT NOT NULL,
        sources JSONB NOT NULL DEFAULT '{}',
        deleted_at TIMESTAMPTZ
    )",
    "CREATE TABLE IF NOT EXISTS user_external_accounts (
        id BIGSERIAL PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        service_type TEXT NOT NULL,
        service_id TEXT NOT NULL,
        client_id TEXT NOT NULL,
        account_id TEXT NOT NULL,
        auth_data JSONB,
        account_data JSONB,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        expired_at TIMESTAMPTZ,
        last_valid_at TIMESTAMPTZ,
        deleted_at TIMESTAMPTZ,
        UNIQUE (service_type, service_id, client_id, account_id)
    )",
    "CREATE TABLE IF NOT EXISTS user_permissions (
        user_id INTEGER NOT NULL,
        permission TEXT NOT NULL,
        object_type TEXT NOT NULL,
        object_ids_ints INTEGER[] NOT NULL DEFAULT '{}',
        updated_at TIMESTAMPTZ NOT NULL,
        synced_at TIMESTAMPTZ,
        PRIMARY KEY (user_id, permission, object_type)
    )",
    "CREATE TABLE IF NOT EXISTS repo_permissions (
        repo_id INTEGER NOT NULL,
        permission TEXT NOT NULL,
        user_ids_ints INTEGER[] NOT NULL DEFAULT '{}',
        updated_at TIMESTAMPTZ NOT NULL,
        synced_at TIMESTAMPTZ,
        unrestricted BOOLEAN NOT NULL DEFAULT FALSE,
        PRIMARY KEY (repo_id, permission)
    )",
    "CREATE TABLE IF NOT EXISTS user_pending_permissions (
        id BIGSERIAL PRIMARY KEY,
        service_type TEXT NOT NULL,
        service_id TEXT NOT NULL,
        bind_id TEXT NOT NULL,
        permission TEXT NOT NULL,
        object_type TEXT NOT NULL,
        object_ids_ints INTEGER[] NOT NULL DEFAULT '{}',
        updated_at TIMESTAMPTZ NOT NULL,
        UNIQUE (service_type, service_id, permission, object_type, bind_id)
    )",
    "CREATE TABLE IF NOT EXISTS repo_pending_permissions (
        repo_id INTEGER NOT NULL,
        permission TEXT NOT NULL,
        user_ids_ints BIGINT[] NOT NULL DEFAULT '{}',
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (repo_id, permission)
    )",
    "CREATE TABLE IF NOT EXISTS sub_repo_permissions (
        user_id INTEGER NOT NULL,
        repo_id INTEGER NOT NULL,
        path_includes TEXT[] NOT NULL DEFAULT '{}',
        path_excludes TEXT[] NOT NULL DEFAULT '{}',
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (user_id, repo_id)
    )",
    "CREATE TABLE IF NOT EXISTS permission_sync_jobs (
        id BIGSERIAL PRIMARY KEY,
        state TEXT NOT NULL DEFAULT 'queued',
        user_id INTEGER,
        repository_id INTEGER,
        priority INTEGER NOT NULL DEFAULT 0,
        invalidate_caches BOOLEAN NOT NULL DEFAULT FALSE,
        reason TEXT,
        failure_message TEXT,
        num_resets INTEGER NOT NULL DEFAULT 0,
        num_failures INTEGER NOT NULL DEFAULT 0,
        queued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        started_at TIMESTAMPTZ,
        finished_at TIMESTAMPTZ,
        last_heartbeat_at TIMESTAMPTZ,
        worker_hostname TEXT,
        code_host_states JSONB,
        CHECK ((user_id IS NULL) <> (repository_id IS NULL))
    )",
    "CREATE INDEX IF NOT EXISTS idx_permission_sync_jobs_dequeue
        ON permission_sync_jobs (state, priority DESC, queued_at)",
    "CREATE INDEX IF NOT EXISTS idx_user_permissions_synced_at ON user_permissions (synced_at)",
    "CREATE INDEX IF NOT EXISTS idx_repo_permissions_synced_at ON repo_permissions (synced_at)"
];

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool
}

impl PostgresStore {
    pub async fn new(connection_url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(connection_url).await?;
        Ok(Self { pool })
    }

    pub async fn connect_with(connection_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn initialize_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        info!("Permissions schema initialized");
        Ok(())
    }

    pub async fn begin(&self) -> StoreResult<PostgresTransaction> {
        let tx = self.pool.begin().await?;
        Ok(PostgresTransaction {
            tx: Mutex::new(Some(tx))
        })
    }

    pub async fn insert_user(&self, username: &str, site_admin: bool) -> StoreResult<User> {
        let row = sqlx::query(
            "INSERT INTO users (username, site_admin) VALUES ($1, $2)
             RETURNING id, username, site_admin, created_at"
        )
        .bind(username)
        .bind(site_admin)
        .fetch_one(&self.pool)
        .await?;
        user_from_row(&row)
    }

    pub async fn add_user_email(&self, user_id: UserId, email: &str, verified: bool) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO user_emails (user_id, email, verified_at)
             VALUES ($1, $2, CASE WHEN $3 THEN NOW() ELSE NULL END)
             ON CONFLICT (user_id, email) DO UPDATE SET verified_at = EXCLUDED.verified_at"
        )
        .bind(user_id)
        .bind(email)
        .bind(verified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Inserts the repository and returns it with its assigned ID.
    pub async fn insert_repo(&self, repo: &Repo) -> StoreResult<Repo> {
        let row = sqlx::query(
            "INSERT INTO repo (name, private, external_id, external_service_type, external_service_id, sources)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id, name, private, external_id, external_service_type, external_service_id, sources"
        )
        .bind(&repo.name)
        .bind(repo.private)
        .bind(&repo.external_repo.id)
        .bind(&repo.external_repo.service_type)
        .bind(&repo.external_repo.service_id)
        .bind(serde_json::to_value(&repo.sources)?)
        .fetch_one(&self.pool)
        .await?;
        repo_from_row(&row)
    }
}

pub struct PostgresTransaction {
    tx: Mutex<Option<Transaction<'static, Postgres>>>
}

impl PostgresTransaction {
    pub async fn finish(self) -> StoreResult<()> {
        let tx = self.tx.into_inner().ok_or(StoreError::TransactionClosed)?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl PermsTransaction for PostgresTransaction {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        (*self).finish().await
    }
}

#[async_trait]
impl PermsStore for PostgresStore {
    async fn transact(&self) -> StoreResult<Box<dyn PermsTransaction>> {
        Ok(Box::new(self.begin().await?))
    }
}

macro_rules! in_tx {
    ($self:ident, $method:ident $(, $arg:expr)*) => {{
        let tx = $self.begin().await?;
        let out = tx.$method($($arg),*).await?;
        tx.finish().await?;
        Ok(out)
    }};
}

#[async_trait]
impl PermsOps for PostgresStore {
    async fn load_user_permissions(&self, user_id: UserId) -> StoreResult<Option<UserPermissions>> {
        in_tx!(self, load_user_permissions, user_id)
    }

    async fn load_repo_permissions(&self, repo_id: RepoId) -> StoreResult<Option<RepoPermissions>> {
        in_tx!(self, load_repo_permissions, repo_id)
    }

    async fn set_user_permissions(&self, perms: &UserPermissions) -> StoreResult<PermsDiff> {
        in_tx!(self, set_user_permissions, perms)
    }

    async fn set_repo_permissions(&self, perms: &RepoPermissions) -> StoreResult<PermsDiff> {
        in_tx!(self, set_repo_permissions, perms)
    }

    async fn touch_user_permissions(&self, user_id: UserId) -> StoreResult<()> {
        in_tx!(self, touch_user_permissions, user_id)
    }

    async fn touch_repo_permissions(&self, repo_id: RepoId) -> StoreResult<()> {
        in_tx!(self, touch_repo_permissions, repo_id)
    }

    async fn set_repo_pending_permissions(
        &self,
        accounts: &Accounts,
        perms: &RepoPermissions
    ) -> StoreResult<()> {
        in_tx!(self, set_repo_pending_permissions, accounts, perms)
    }

    async fn load_user_pending_permissions(
        &self,
        spec: &AccountSpec
    ) -> StoreResult<Option<UserPendingPermissions>> {
        in_tx!(self, load_user_pending_permissions, spec)
    }

    async fn grant_pending_permissions(&self, user_id: UserId, spec: &AccountSpec) -> StoreResult<usize> {
        in_tx!(self, grant_pending_permissions, user_id, spec)
    }

    async fn set_sub_repo_permissions(
        &self,
        user_id: UserId,
        repo_id: RepoId,
        perms: &SubRepoPermissions
    ) -> StoreResult<()> {
        in_tx!(self, set_sub_repo_permissions, user_id, repo_id, perms)
    }

    async fn load_sub_repo_permissions(
        &self,
        user_id: UserId,
        repo_id: RepoId
    ) -> StoreResult<Option<SubRepoPermissions>> {
        in_tx!(self, load_sub_repo_permissions, user_id, repo_id)
    }

    async fn retain_sub_repo_permissions(&self, user_id: UserId, keep: &[RepoId]) -> StoreResult<usize> {
        in_tx!(self, retain_sub_repo_permissions, user_id, keep)
    }

    async fn get_user_ids_by_external_accounts(
        &self,
        accounts: &Accounts
    ) -> StoreResult<HashMap<String, UserId>> {
        in_tx!(self, get_user_ids_by_external_accounts, accounts)
    }

    async fn user_ids_with_no_perms(&self) -> StoreResult<Vec<UserId>> {
        in_tx!(self, user_ids_with_no_perms)
    }

    async fn repo_ids_with_no_perms(&self) -> StoreResult<Vec<RepoId>> {
        in_tx!(self, repo_ids_with_no_perms)
    }

    async fn user_ids_with_oldest_perms(
        &self,
        limit: usize,
        age: Duration
    ) -> StoreResult<HashMap<UserId, DateTime<Utc>>> {
        in_tx!(self, user_ids_with_oldest_perms, limit, age)
    }

    async fn repo_ids_with_oldest_perms(
        &self,
        limit: usize,
        age: Duration
    ) -> StoreResult<HashMap<RepoId, DateTime<Utc>>> {
        in_tx!(self, repo_ids_with_oldest_perms, limit, age)
    }

    async fn delete_all_user_permissions(&self, user_id: UserId) -> StoreResult<()> {
        in_tx!(self, delete_all_user_permissions, user_id)
    }
}

fn user_from_row(row: &PgRow) -> StoreResult<User> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        site_admin: row.try_get("site_admin")?,
        created_at: row.try_get("created_at")?
    })
}

fn repo_from_row(row: &PgRow) -> StoreResult<Repo> {
    let sources: BTreeMap<String, String> = serde_json::from_value(row.try_get("sources")?)?;
    Ok(Repo {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        private: row.try_get("private")?,
        external_repo: ExternalRepoSpec {
            id: row.try_get("external_id")?,
            service_type: row.try_get("external_service_type")?,
            service_id: row.try_get("external_service_id")?
        },
        sources
    })
}

fn account_from_row(row: &PgRow) -> StoreResult<Account> {
    Ok(Account {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        spec: AccountSpec {
            service_type: row.try_get("service_type")?,
            service_id: row.try_get("service_id")?,
            client_id: row.try_get("client_id")?,
            account_id: row.try_get("account_id")?
        },
        data: AccountData {
            auth_data: row.try_get("auth_data")?,
            data: row.try_get("account_data")?
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        expired_at: row.try_get("expired_at")?,
        last_valid_at: row.try_get("last_valid_at")?
    })
}

const ACCOUNT_COLUMNS: &str = "id, user_id, service_type, service_id, client_id, account_id, auth_data, \
     account_data, created_at, updated_at, expired_at, last_valid_at";

#[async_trait]
impl UserStore for PostgresStore {
    async fn get_by_id(&self, id: UserId) -> StoreResult<Option<User>> {
        let row = sqlx::query(
            "SELECT id, username, site_admin, created_at FROM users WHERE id = $1 AND deleted_at IS NULL"
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn list(&self, ids: &[UserId]) -> StoreResult<Vec<User>> {
        let rows = sqlx::query(
            "SELECT id, username, site_admin, created_at FROM users
             WHERE id = ANY($1) AND deleted_at IS NULL ORDER BY id"
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn verified_emails(&self, id: UserId) -> StoreResult<Vec<String>> {
        let emails = sqlx::query_scalar(
            "SELECT email FROM user_emails WHERE user_id = $1 AND verified_at IS NOT NULL ORDER BY email"
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(emails)
    }
}

#[async_trait]
impl RepoStore for PostgresStore {
    async fn get_by_id(&self, id: RepoId) -> StoreResult<Option<Repo>> {
        let row = sqlx::query(
            "SELECT id, name, private, external_id, external_service_type, external_service_id, sources
             FROM repo WHERE id = $1 AND deleted_at IS NULL"
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(repo_from_row).transpose()
    }

    async fn list(&self, opts: &RepoListOptions) -> StoreResult<Vec<Repo>> {
        fn columns(specs: &[ExternalRepoSpec]) -> (Vec<String>, Vec<String>, Vec<String>) {
            (
                specs.iter().map(|s| s.id.clone()).collect(),
                specs.iter().map(|s| s.service_type.clone()).collect(),
                specs.iter().map(|s| s.service_id.clone()).collect()
            )
        }
        let (exact_ids, exact_types, exact_services) = columns(&opts.external_repos);
        let (include_ids, include_types, include_services) =
            columns(&opts.external_repo_include_contains);
        let (exclude_ids, exclude_types, exclude_services) =
            columns(&opts.external_repo_exclude_contains);

        let rows = sqlx::query(
            "SELECT id, name, private, external_id, external_service_type, external_service_id, sources
             FROM repo
             WHERE deleted_at IS NULL
               AND (cardinality($1::INT[]) = 0 OR id = ANY($1))
               AND (NOT $2 OR private)
               AND (cardinality($3::TEXT[]) = 0 OR EXISTS (
                   SELECT 1 FROM UNNEST($3::TEXT[], $4::TEXT[], $5::TEXT[]) AS s(id, st, sid)
                   WHERE external_id = s.id AND external_service_type = s.st AND external_service_id = s.sid))
               AND (cardinality($6::TEXT[]) = 0 OR EXISTS (
                   SELECT 1 FROM UNNEST($6::TEXT[], $7::TEXT[], $8::TEXT[]) AS s(id, st, sid)
                   WHERE starts_with(external_id, s.id) AND external_service_type = s.st AND external_service_id = s.sid))
               AND NOT EXISTS (
                   SELECT 1 FROM UNNEST($9::TEXT[], $10::TEXT[], $11::TEXT[]) AS s(id, st, sid)
                   WHERE starts_with(external_id, s.id) AND external_service_type = s.st AND external_service_id = s.sid)
             ORDER BY id"
        )
        .bind(&opts.ids)
        .bind(opts.only_private)
        .bind(&exact_ids)
        .bind(&exact_types)
        .bind(&exact_services)
        .bind(&include_ids)
        .bind(&include_types)
        .bind(&include_services)
        .bind(&exclude_ids)
        .bind(&exclude_types)
        .bind(&exclude_services)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(repo_from_row).collect()
    }
}

#[async_trait]
impl ExternalAccountStore for PostgresStore {
    async fn list(&self, opts: &ExternalAccountsListOptions) -> StoreResult<Vec<Account>> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM user_external_accounts
             WHERE deleted_at IS NULL
               AND ($1::INT IS NULL OR user_id = $1)
               AND ($2::TEXT IS NULL OR service_type = $2)
               AND ($3::TEXT IS NULL OR service_id = $3)
               AND (cardinality($4::TEXT[]) = 0 OR account_id = ANY($4))
               AND (NOT $5 OR expired_at IS NULL)
               AND (NOT $6 OR expired_at IS NOT NULL)
             ORDER BY id"
        );
        let rows = sqlx::query(sqlx::AssertSqlSafe(sql.as_str()))
            .bind(opts.user_id)
            .bind(&opts.service_type)
            .bind(&opts.service_id)
            .bind(&opts.account_ids)
            .bind(opts.exclude_expired)
            .bind(opts.only_expired)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(account_from_row).collect()
    }

    async fn upsert(&self, account: &Account) -> StoreResult<Account> {
        let sql = format!(
            "INSERT INTO user_external_accounts
                 (user_id, service_type, service_id, client_id, account_id, auth_data, account_data)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (service_type, service_id, client_id, account_id) DO UPDATE SET
                 user_id = EXCLUDED.user_id,
                 auth_data = EXCLUDED.auth_data,
                 account_data = EXCLUDED.account_data,
                 updated_at = NOW(),
                 expired_at = NULL,
                 deleted_at = NULL
             RETURNING {ACCOUNT_COLUMNS}"
        );
        let row = sqlx::query(sqlx::AssertSqlSafe(sql.as_str()))
            .bind(account.user_id)
            .bind(&account.spec.service_type)
            .bind(&account.spec.service_id)
            .bind(&account.spec.client_id)
            .bind(&account.spec.account_id)
            .bind(&account.data.auth_data)
            .bind(&account.data.data)
            .fetch_one(&self.pool)
            .await?;
        account_from_row(&row)
    }

    async fn touch_expired(&self, id: i64) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE user_external_accounts SET expired_at = NOW(), updated_at = NOW() WHERE id = $1"
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("external account", id));
        }
        Ok(())
    }

    async fn touch_last_valid(&self, id: i64) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE user_external_accounts
             SET expired_at = NULL, last_valid_at = NOW(), updated_at = NOW() WHERE id = $1"
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("external account", id));
        }
        Ok(())
    }
}

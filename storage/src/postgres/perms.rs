use super::PostgresTransaction;
use crate::error::{StoreError, StoreResult};
use crate::traits::{PermsDiff, PermsOps};
use async_trait::async_trait;
use authz::{
    AccountSpec, Accounts, PermType, Perms, RepoId, RepoPermissions, SubRepoPermissions, UserId,
    UserPendingPermissions, UserPermissions,
};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Postgres, Row, Transaction};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

const READ: &str = "read";
const REPOS: &str = "repos";

fn conn<'a>(
    guard: &'a mut Option<Transaction<'static, Postgres>>
) -> StoreResult<&'a mut PgConnection> {
    guard.as_deref_mut().ok_or(StoreError::TransactionClosed)
}

fn diff<T: Copy + Ord>(new: &BTreeSet<T>, old: &BTreeSet<T>) -> (Vec<T>, Vec<T>) {
    (
        new.difference(old).copied().collect(),
        old.difference(new).copied().collect()
    )
}

fn cutoff(age: Duration) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero())
}

async fn add_user_to_repos(
    conn: &mut PgConnection,
    user_id: UserId,
    repo_ids: &[RepoId],
    now: DateTime<Utc>
) -> StoreResult<()> {
    if repo_ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        "INSERT INTO repo_permissions (repo_id, permission, user_ids_ints, updated_at)
         SELECT id, $2, ARRAY[$3::INT], $4 FROM UNNEST($1::INT[]) AS id
         ON CONFLICT (repo_id, permission) DO UPDATE SET
             user_ids_ints = CASE
                 WHEN $3::INT = ANY(repo_permissions.user_ids_ints) THEN repo_permissions.user_ids_ints
                 ELSE array_append(repo_permissions.user_ids_ints, $3::INT)
             END,
             updated_at = EXCLUDED.updated_at"
    )
    .bind(repo_ids)
    .bind(READ)
    .bind(user_id)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

async fn remove_user_from_repos(
    conn: &mut PgConnection,
    user_id: UserId,
    repo_ids: &[RepoId],
    now: DateTime<Utc>
) -> StoreResult<()> {
    if repo_ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        "UPDATE repo_permissions
         SET user_ids_ints = array_remove(user_ids_ints, $1::INT), updated_at = $2
         WHERE repo_id = ANY($3) AND permission = $4"
    )
    .bind(user_id)
    .bind(now)
    .bind(repo_ids)
    .bind(READ)
    .execute(conn)
    .await?;
    Ok(())
}

async fn add_repo_to_users(
    conn: &mut PgConnection,
    repo_id: RepoId,
    user_ids: &[UserId],
    now: DateTime<Utc>
) -> StoreResult<()> {
    if user_ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        "INSERT INTO user_permissions (user_id, permission, object_type, object_ids_ints, updated_at)
         SELECT id, $2, $3, ARRAY[$4::INT], $5 FROM UNNEST($1::INT[]) AS id
         ON CONFLICT (user_id, permission, object_type) DO UPDATE SET
             object_ids_ints = CASE
                 WHEN $4::INT = ANY(user_permissions.object_ids_ints) THEN user_permissions.object_ids_ints
                 ELSE array_append(user_permissions.object_ids_ints, $4::INT)
             END,
             updated_at = EXCLUDED.updated_at"
    )
    .bind(user_ids)
    .bind(READ)
    .bind(REPOS)
    .bind(repo_id)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

async fn remove_repo_from_users(
    conn: &mut PgConnection,
    repo_id: RepoId,
    user_ids: &[UserId],
    now: DateTime<Utc>
) -> StoreResult<()> {
    if user_ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        "UPDATE user_permissions
         SET object_ids_ints = array_remove(object_ids_ints, $1::INT), updated_at = $2
         WHERE user_id = ANY($3) AND permission = $4 AND object_type = $5"
    )
    .bind(repo_id)
    .bind(now)
    .bind(user_ids)
    .bind(READ)
    .bind(REPOS)
    .execute(conn)
    .await?;
    Ok(())
}

async fn oldest(
    conn: &mut PgConnection,
    sql: &'static str,
    limit: usize,
    age: Duration
) -> StoreResult<HashMap<i32, DateTime<Utc>>> {
    let rows = sqlx::query(sql)
        .bind(cutoff(age))
        .bind(limit as i64)
        .fetch_all(conn)
        .await?;
    rows.iter()
        .map(|row| -> StoreResult<(i32, DateTime<Utc>)> {
            let synced_at: Option<DateTime<Utc>> = row.try_get("synced_at")?;
            Ok((
                row.try_get("id")?,
                synced_at.unwrap_or(DateTime::<Utc>::MIN_UTC)
            ))
        })
        .collect()
}

#[async_trait]
impl PermsOps for PostgresTransaction {
    async fn load_user_permissions(&self, user_id: UserId) -> StoreResult<Option<UserPermissions>> {
        let mut guard = self.tx.lock().await;
        let conn = conn(&mut guard)?;
        let row = sqlx::query(
            "SELECT object_ids_ints, updated_at, synced_at FROM user_permissions
             WHERE user_id = $1 AND permission = $2 AND object_type = $3"
        )
        .bind(user_id)
        .bind(READ)
        .bind(REPOS)
        .fetch_optional(conn)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let ids: Vec<RepoId> = row.try_get("object_ids_ints")?;
        let mut perms = UserPermissions::new(user_id, ids);
        perms.updated_at = Some(row.try_get("updated_at")?);
        perms.synced_at = row.try_get("synced_at")?;
        Ok(Some(perms))
    }

    async fn load_repo_permissions(&self, repo_id: RepoId) -> StoreResult<Option<RepoPermissions>> {
        let mut guard = self.tx.lock().await;
        let conn = conn(&mut guard)?;
        let row = sqlx::query(
            "SELECT user_ids_ints, updated_at, synced_at, unrestricted FROM repo_permissions
             WHERE repo_id = $1 AND permission = $2"
        )
        .bind(repo_id)
        .bind(READ)
        .fetch_optional(conn)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let user_ids: Vec<UserId> = row.try_get("user_ids_ints")?;
        let mut perms = RepoPermissions::new(repo_id, user_ids);
        perms.updated_at = Some(row.try_get("updated_at")?);
        perms.synced_at = row.try_get("synced_at")?;
        perms.unrestricted = row.try_get("unrestricted")?;
        Ok(Some(perms))
    }

    async fn set_user_permissions(&self, perms: &UserPermissions) -> StoreResult<PermsDiff> {
        let mut guard = self.tx.lock().await;
        let conn = conn(&mut guard)?;
        let now = Utc::now();

        let old: Option<Vec<RepoId>> = sqlx::query_scalar(
            "SELECT object_ids_ints FROM user_permissions
             WHERE user_id = $1 AND permission = $2 AND object_type = $3 FOR UPDATE"
        )
        .bind(perms.user_id)
        .bind(READ)
        .bind(REPOS)
        .fetch_optional(&mut *conn)
        .await?;
        let old: BTreeSet<RepoId> = old.unwrap_or_default().into_iter().collect();
        let (added, removed) = diff(&perms.ids, &old);

        add_user_to_repos(&mut *conn, perms.user_id, &added, now).await?;
        remove_user_from_repos(&mut *conn, perms.user_id, &removed, now).await?;

        sqlx::query(
            "INSERT INTO user_permissions (user_id, permission, object_type, object_ids_ints, updated_at, synced_at)
             VALUES ($1, $2, $3, $4, $5, $5)
             ON CONFLICT (user_id, permission, object_type) DO UPDATE SET
                 object_ids_ints = EXCLUDED.object_ids_ints,
                 updated_at = EXCLUDED.updated_at,
                 synced_at = EXCLUDED.synced_at"
        )
        .bind(perms.user_id)
        .bind(READ)
        .bind(REPOS)
        .bind(perms.sorted_ids())
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Ok(PermsDiff {
            added: added.len(),
            removed: removed.len(),
            found: perms.ids.len()
        })
    }

    async fn set_repo_permissions(&self, perms: &RepoPermissions) -> StoreResult<PermsDiff> {
        let mut guard = self.tx.lock().await;
        let conn = conn(&mut guard)?;
        let now = Utc::now();

        let old: Option<Vec<UserId>> = sqlx::query_scalar(
            "SELECT user_ids_ints FROM repo_permissions
             WHERE repo_id = $1 AND permission = $2 FOR UPDATE"
        )
        .bind(perms.repo_id)
        .bind(READ)
        .fetch_optional(&mut *conn)
        .await?;
        let old: BTreeSet<UserId> = old.unwrap_or_default().into_iter().collect();
        let (added, removed) = diff(&perms.user_ids, &old);

        add_repo_to_users(&mut *conn, perms.repo_id, &added, now).await?;
        remove_repo_from_users(&mut *conn, perms.repo_id, &removed, now).await?;

        sqlx::query(
            "INSERT INTO repo_permissions (repo_id, permission, user_ids_ints, updated_at, synced_at, unrestricted)
             VALUES ($1, $2, $3, $4, $4, $5)
             ON CONFLICT (repo_id, permission) DO UPDATE SET
                 user_ids_ints = EXCLUDED.user_ids_ints,
                 updated_at = EXCLUDED.updated_at,
                 synced_at = EXCLUDED.synced_at,
                 unrestricted = EXCLUDED.unrestricted"
        )
        .bind(perms.repo_id)
        .bind(READ)
        .bind(perms.sorted_user_ids())
        .bind(now)
        .bind(perms.unrestricted)
        .execute(&mut *conn)
        .await?;

        Ok(PermsDiff {
            added: added.len(),
            removed: removed.len(),
            found: perms.user_ids.len()
        })
    }

    async fn touch_user_permissions(&self, user_id: UserId) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = conn(&mut guard)?;
        sqlx::query(
            "INSERT INTO user_permissions (user_id, permission, object_type, updated_at, synced_at)
             VALUES ($1, $2, $3, $4, $4)
             ON CONFLICT (user_id, permission, object_type) DO UPDATE SET
                 updated_at = EXCLUDED.updated_at,
                 synced_at = EXCLUDED.synced_at"
        )
        .bind(user_id)
        .bind(READ)
        .bind(REPOS)
        .bind(Utc::now())
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn touch_repo_permissions(&self, repo_id: RepoId) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = conn(&mut guard)?;
        sqlx::query(
            "INSERT INTO repo_permissions (repo_id, permission, updated_at, synced_at)
             VALUES ($1, $2, $3, $3)
             ON CONFLICT (repo_id, permission) DO UPDATE SET
                 updated_at = EXCLUDED.updated_at,
                 synced_at = EXCLUDED.synced_at"
        )
        .bind(repo_id)
        .bind(READ)
        .bind(Utc::now())
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn set_repo_pending_permissions(
        &self,
        accounts: &Accounts,
        perms: &RepoPermissions
    ) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = conn(&mut guard)?;
        let now = Utc::now();

        let pending_ids: Vec<i64> = sqlx::query_scalar(
            "INSERT INTO user_pending_permissions
                 (service_type, service_id, bind_id, permission, object_type, updated_at)
             SELECT $1, $2, bind_id, $3, $4, $5 FROM UNNEST($6::TEXT[]) AS bind_id
             ON CONFLICT (service_type, service_id, permission, object_type, bind_id)
                 DO UPDATE SET updated_at = EXCLUDED.updated_at
             RETURNING id"
        )
        .bind(&accounts.service_type)
        .bind(&accounts.service_id)
        .bind(READ)
        .bind(REPOS)
        .bind(now)
        .bind(&accounts.account_ids)
        .fetch_all(&mut *conn)
        .await?;
        let pending_ids: BTreeSet<i64> = pending_ids.into_iter().collect();

        let old: Option<Vec<i64>> = sqlx::query_scalar(
            "SELECT user_ids_ints FROM repo_pending_permissions
             WHERE repo_id = $1 AND permission = $2 FOR UPDATE"
        )
        .bind(perms.repo_id)
        .bind(READ)
        .fetch_optional(&mut *conn)
        .await?;
        let old: BTreeSet<i64> = old.unwrap_or_default().into_iter().collect();
        let (added, removed) = diff(&pending_ids, &old);

        // Rows granted since the last write are gone and simply not matched.
        if !added.is_empty() {
            sqlx::query(
                "UPDATE user_pending_permissions SET
                     object_ids_ints = CASE
                         WHEN $1::INT = ANY(object_ids_ints) THEN object_ids_ints
                         ELSE array_append(object_ids_ints, $1::INT)
                     END,
                     updated_at = $2
                 WHERE id = ANY($3)"
            )
            .bind(perms.repo_id)
            .bind(now)
            .bind(&added)
            .execute(&mut *conn)
            .await?;
        }
        if !removed.is_empty() {
            sqlx::query(
                "UPDATE user_pending_permissions
                 SET object_ids_ints = array_remove(object_ids_ints, $1::INT), updated_at = $2
                 WHERE id = ANY($3)"
            )
            .bind(perms.repo_id)
            .bind(now)
            .bind(&removed)
            .execute(&mut *conn)
            .await?;
        }

        sqlx::query(
            "INSERT INTO repo_pending_permissions (repo_id, permission, user_ids_ints, updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (repo_id, permission) DO UPDATE SET
                 user_ids_ints = EXCLUDED.user_ids_ints,
                 updated_at = EXCLUDED.updated_at"
        )
        .bind(perms.repo_id)
        .bind(READ)
        .bind(pending_ids.into_iter().collect::<Vec<_>>())
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn load_user_pending_permissions(
        &self,
        spec: &AccountSpec
    ) -> StoreResult<Option<UserPendingPermissions>> {
        let mut guard = self.tx.lock().await;
        let conn = conn(&mut guard)?;
        let row = sqlx::query(
            "SELECT id, object_ids_ints, updated_at FROM user_pending_permissions
             WHERE service_type = $1 AND service_id = $2 AND bind_id = $3
               AND permission = $4 AND object_type = $5"
        )
        .bind(&spec.service_type)
        .bind(&spec.service_id)
        .bind(&spec.account_id)
        .bind(READ)
        .bind(REPOS)
        .fetch_optional(conn)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let ids: Vec<RepoId> = row.try_get("object_ids_ints")?;
        Ok(Some(UserPendingPermissions {
            id: row.try_get("id")?,
            service_type: spec.service_type.clone(),
            service_id: spec.service_id.clone(),
            bind_id: spec.account_id.clone(),
            perm: Perms::Read,
            perm_type: PermType::Repos,
            ids: ids.into_iter().collect(),
            updated_at: Some(row.try_get("updated_at")?)
        }))
    }

    async fn grant_pending_permissions(&self, user_id: UserId, spec: &AccountSpec) -> StoreResult<usize> {
        let mut guard = self.tx.lock().await;
        let conn = conn(&mut guard)?;
        let now = Utc::now();

        let pending: Option<Vec<RepoId>> = sqlx::query_scalar(
            "DELETE FROM user_pending_permissions
             WHERE service_type = $1 AND service_id = $2 AND bind_id = $3
               AND permission = $4 AND object_type = $5
             RETURNING object_ids_ints"
        )
        .bind(&spec.service_type)
        .bind(&spec.service_id)
        .bind(&spec.account_id)
        .bind(READ)
        .bind(REPOS)
        .fetch_optional(&mut *conn)
        .await?;
        let Some(repo_ids) = pending else {
            return Ok(0);
        };
        if repo_ids.is_empty() {
            return Ok(0);
        }

        sqlx::query(
            "INSERT INTO user_permissions (user_id, permission, object_type, object_ids_ints, updated_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (user_id, permission, object_type) DO UPDATE SET
                 object_ids_ints = ARRAY(
                     SELECT DISTINCT UNNEST(user_permissions.object_ids_ints || EXCLUDED.object_ids_ints)
                 ),
                 updated_at = EXCLUDED.updated_at"
        )
        .bind(user_id)
        .bind(READ)
        .bind(REPOS)
        .bind(&repo_ids)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        add_user_to_repos(&mut *conn, user_id, &repo_ids, now).await?;

        Ok(repo_ids.len())
    }

    async fn set_sub_repo_permissions(
        &self,
        user_id: UserId,
        repo_id: RepoId,
        perms: &SubRepoPermissions
    ) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = conn(&mut guard)?;
        sqlx::query(
            "INSERT INTO sub_repo_permissions (user_id, repo_id, path_includes, path_excludes, updated_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (user_id, repo_id) DO UPDATE SET
                 path_includes = EXCLUDED.path_includes,
                 path_excludes = EXCLUDED.path_excludes,
                 updated_at = EXCLUDED.updated_at"
        )
        .bind(user_id)
        .bind(repo_id)
        .bind(&perms.path_includes)
        .bind(&perms.path_excludes)
        .bind(Utc::now())
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn load_sub_repo_permissions(
        &self,
        user_id: UserId,
        repo_id: RepoId
    ) -> StoreResult<Option<SubRepoPermissions>> {
        let mut guard = self.tx.lock().await;
        let conn = conn(&mut guard)?;
        let row = sqlx::query(
            "SELECT path_includes, path_excludes FROM sub_repo_permissions
             WHERE user_id = $1 AND repo_id = $2"
        )
        .bind(user_id)
        .bind(repo_id)
        .fetch_optional(conn)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(SubRepoPermissions {
            path_includes: row.try_get("path_includes")?,
            path_excludes: row.try_get("path_excludes")?
        }))
    }

    async fn retain_sub_repo_permissions(&self, user_id: UserId, keep: &[RepoId]) -> StoreResult<usize> {
        let mut guard = self.tx.lock().await;
        let conn = conn(&mut guard)?;
        let result = sqlx::query(
            "DELETE FROM sub_repo_permissions WHERE user_id = $1 AND NOT (repo_id = ANY($2))"
        )
        .bind(user_id)
        .bind(keep)
        .execute(conn)
        .await?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    async fn get_user_ids_by_external_accounts(
        &self,
        accounts: &Accounts
    ) -> StoreResult<HashMap<String, UserId>> {
        let mut guard = self.tx.lock().await;
        let conn = conn(&mut guard)?;
        let rows = sqlx::query(
            "SELECT account_id, user_id FROM user_external_accounts
             WHERE service_type = $1 AND service_id = $2 AND account_id = ANY($3)
               AND deleted_at IS NULL"
        )
        .bind(&accounts.service_type)
        .bind(&accounts.service_id)
        .bind(&accounts.account_ids)
        .fetch_all(conn)
        .await?;
        rows.iter()
            .map(|row| -> StoreResult<(String, UserId)> {
                Ok((row.try_get("account_id")?, row.try_get("user_id")?))
            })
            .collect()
    }

    async fn user_ids_with_no_perms(&self) -> StoreResult<Vec<UserId>> {
        let mut guard = self.tx.lock().await;
        let conn = conn(&mut guard)?;
        let ids = sqlx::query_scalar(
            "SELECT users.id FROM users
             WHERE users.deleted_at IS NULL
               AND NOT EXISTS (SELECT 1 FROM user_permissions p WHERE p.user_id = users.id)
             ORDER BY users.id"
        )
        .fetch_all(conn)
        .await?;
        Ok(ids)
    }

    async fn repo_ids_with_no_perms(&self) -> StoreResult<Vec<RepoId>> {
        let mut guard = self.tx.lock().await;
        let conn = conn(&mut guard)?;
        let ids = sqlx::query_scalar(
            "SELECT repo.id FROM repo
             WHERE repo.deleted_at IS NULL AND repo.private
               AND NOT EXISTS (SELECT 1 FROM repo_permissions p WHERE p.repo_id = repo.id)
             ORDER BY repo.id"
        )
        .fetch_all(conn)
        .await?;
        Ok(ids)
    }

    async fn user_ids_with_oldest_perms(
        &self,
        limit: usize,
        age: Duration
    ) -> StoreResult<HashMap<UserId, DateTime<Utc>>> {
        let mut guard = self.tx.lock().await;
        let conn = conn(&mut guard)?;
        oldest(
            conn,
            "SELECT p.user_id AS id, p.synced_at FROM user_permissions p
             JOIN users ON users.id = p.user_id
             WHERE users.deleted_at IS NULL AND (p.synced_at IS NULL OR p.synced_at <= $1)
             ORDER BY p.synced_at ASC NULLS FIRST
             LIMIT $2",
            limit,
            age
        )
        .await
    }

    async fn repo_ids_with_oldest_perms(
        &self,
        limit: usize,
        age: Duration
    ) -> StoreResult<HashMap<RepoId, DateTime<Utc>>> {
        let mut guard = self.tx.lock().await;
        let conn = conn(&mut guard)?;
        oldest(
            conn,
            "SELECT p.repo_id AS id, p.synced_at FROM repo_permissions p
             JOIN repo ON repo.id = p.repo_id
             WHERE repo.deleted_at IS NULL AND (p.synced_at IS NULL OR p.synced_at <= $1)
             ORDER BY p.synced_at ASC NULLS FIRST
             LIMIT $2",
            limit,
            age
        )
        .await
    }

    async fn delete_all_user_permissions(&self, user_id: UserId) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let conn = conn(&mut guard)?;
        let ids: Option<Vec<RepoId>> = sqlx::query_scalar(
            "DELETE FROM user_permissions WHERE user_id = $1 RETURNING object_ids_ints"
        )
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;
        remove_user_from_repos(&mut *conn, user_id, &ids.unwrap_or_default(), Utc::now()).await?;
        sqlx::query("DELETE FROM sub_repo_permissions WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

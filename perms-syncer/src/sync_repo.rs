//! Repo-centric sync: ask the code host that owns a repository which accounts
//! can read it.

use crate::error::PermsSyncResult;
use crate::telemetry::Telemetry;
use crate::queue::RequestType;
use crate::syncer::{PermsSyncer, SyncOutcome};
use authz::{Accounts, CodeHostStatusesSet, FetchPermsOptions, RepoId, RepoPermissions};
use tracing::{debug, warn};

impl PermsSyncer {
    /// Recomputes the users that can access `repo_id`.
    ///
    /// Only the provider whose URN is one of the repository's sources may
    /// answer. Accounts without a local user are recorded as pending
    /// permissions in the same transaction.
    #[tracing::instrument(skip(self, opts))]
    pub async fn sync_repo_perms(
        &self,
        repo_id: RepoId,
        no_perms: bool,
        opts: &FetchPermsOptions
    ) -> PermsSyncResult<SyncOutcome> {
        let Some(repo) = self.stores.repos.get_by_id(repo_id).await? else {
            debug!("Repository not found, skipping permissions sync");
            return Ok(SyncOutcome::default());
        };
        if !repo.private {
            debug!("Repository is public, skipping permissions sync");
            return Ok(SyncOutcome::default());
        }

        let snapshot = self.providers.snapshot();
        let provider = snapshot
            .providers
            .iter()
            .find(|p| repo.has_source(p.urn()))
            .cloned();
        let Some(provider) = provider else {
            debug!(
                providers = snapshot.providers.len(),
                "No authorization provider for repository, touching permissions"
            );
            self.stores.perms.touch_repo_permissions(repo_id).await?;
            return Ok(SyncOutcome::default());
        };

        let first_sync = no_perms
            || self
                .stores
                .perms
                .load_repo_permissions(repo_id)
                .await?
                .is_none_or(|p| p.synced_at.is_none());

        let urn = provider.urn();
        let mut statuses = CodeHostStatusesSet::new();
        let account_ids = match self
            .call_provider(urn, provider.fetch_repo_perms(&repo, opts))
            .await
        {
            Ok(ids) => {
                statuses.push_success(urn, provider.service_type());
                ids
            }
            Err(e) if e.is_not_implemented() => {
                debug!(urn, "Provider does not support repo-centric sync");
                self.stores.perms.touch_repo_permissions(repo_id).await?;
                return Ok(SyncOutcome::default());
            }
            Err(e) => {
                warn!(urn, temporary = e.is_temporary(), error = %e, "Failed to fetch repository permissions");
                Telemetry::record_sync_error(RequestType::Repo, e.reason());
                statuses.push_error(urn, provider.service_type(), &e);

                if !first_sync {
                    self.stores.perms.touch_repo_permissions(repo_id).await?;
                    let ids = self
                        .stores
                        .perms
                        .load_repo_permissions(repo_id)
                        .await?
                        .map(|p| p.sorted_user_ids())
                        .unwrap_or_default();
                    return Ok(SyncOutcome {
                        ids,
                        diff: None,
                        statuses
                    });
                }
                Telemetry::record_first_sync_failure(RequestType::Repo);
                warn!("First permissions sync failed, storing an empty result");
                Vec::new()
            }
        };

        let accounts = Accounts {
            service_type: provider.service_type().to_string(),
            service_id: provider.service_id().to_string(),
            account_ids
        };

        let tx = self.stores.perms.transact().await?;
        let user_ids = tx.get_user_ids_by_external_accounts(&accounts).await?;
        let pending = Accounts {
            account_ids: accounts
                .account_ids
                .iter()
                .filter(|id| !user_ids.contains_key(*id))
                .cloned()
                .collect(),
            ..accounts.clone()
        };

        let perms = RepoPermissions::new(repo_id, user_ids.values().copied());
        let diff = tx.set_repo_permissions(&perms).await?;
        tx.set_repo_pending_permissions(&pending, &perms).await?;
        tx.commit().await?;

        debug!(
            users = perms.user_ids.len(),
            pending = pending.account_ids.len(),
            added = diff.added,
            removed = diff.removed,
            "Stored repository permissions"
        );
        Ok(SyncOutcome {
            ids: perms.sorted_user_ids(),
            diff: Some(diff),
            statuses
        })
    }
}

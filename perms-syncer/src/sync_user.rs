//! User-centric sync: ask every code host the user has an account on which
//! repositories the user can read.

use crate::error::PermsSyncResult;
use crate::telemetry::Telemetry;
use crate::queue::RequestType;
use crate::syncer::{PermsSyncer, SyncOutcome};
use authz::{
    Account, AccountSpec, CodeHostStatusesSet, ExternalRepoSpec, ExternalUserPermissions,
    FetchPermsOptions, Provider, ProviderSet, RepoId, SubRepoPermissions, User, UserId,
    UserPermissions
};
use errors::ProviderResult;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use storage::{ExternalAccountsListOptions, RepoListOptions};
use tracing::{debug, info, warn};

/// Everything gathered from the providers before anything is written.
#[derive(Default)]
struct FetchedUserPerms {
    repo_ids: BTreeSet<RepoId>,
    sub_repo: BTreeMap<RepoId, SubRepoPermissions>,
    /// Accounts that answered successfully; their pending grants are applied.
    linked: Vec<AccountSpec>,
    statuses: CodeHostStatusesSet,
    /// At least one provider failed for a reason other than bad credentials.
    incomplete: bool
}

impl PermsSyncer {
    /// Recomputes the repositories `user_id` can access.
    ///
    /// Accounts whose credentials are rejected are marked expired and
    /// skipped. When any other provider failure occurs the stored permissions
    /// are kept and only the sync timestamp moves, unless the user has never
    /// been synced, in which case whatever was fetched (possibly nothing) is
    /// stored. An answer identical to the stored set also only moves the
    /// timestamp.
    #[tracing::instrument(skip(self, opts))]
    pub async fn sync_user_perms(
        &self,
        user_id: UserId,
        no_perms: bool,
        opts: &FetchPermsOptions
    ) -> PermsSyncResult<SyncOutcome> {
        let Some(user) = self.stores.users.get_by_id(user_id).await? else {
            debug!("User not found, skipping permissions sync");
            return Ok(SyncOutcome::default());
        };

        let snapshot = self.providers.snapshot();
        if snapshot.providers.is_empty() {
            debug!(
                allow_access_by_default = snapshot.allow_access_by_default,
                "No authorization providers configured, touching user permissions"
            );
            self.stores.perms.touch_user_permissions(user_id).await?;
            return Ok(SyncOutcome::default());
        }

        let first_sync = no_perms
            || self
                .stores
                .perms
                .load_user_permissions(user_id)
                .await?
                .is_none_or(|p| p.synced_at.is_none());

        let accounts = self
            .resolve_accounts(&user, &snapshot.providers, first_sync || opts.invalidate_caches)
            .await?;

        let mut fetched = FetchedUserPerms::default();
        for account in &accounts {
            let Some(provider) = snapshot
                .providers
                .by_service(&account.spec.service_type, &account.spec.service_id)
                .into_iter()
                .next()
            else {
                debug!(
                    account_id = account.id,
                    service_id = %account.spec.service_id,
                    "No provider for external account"
                );
                continue;
            };
            self.fetch_account_perms(&provider, account, opts, &mut fetched)
                .await?;
        }

        let preserve = fetched.incomplete && !first_sync;
        if fetched.incomplete && first_sync {
            Telemetry::record_first_sync_failure(RequestType::User);
            warn!("First permissions sync failed, storing the partial result");
        }

        let tx = self.stores.perms.transact().await?;
        let unchanged = !first_sync
            && tx
                .load_user_permissions(user_id)
                .await?
                .is_some_and(|stored| stored.ids == fetched.repo_ids);
        let diff = if preserve || unchanged {
            tx.touch_user_permissions(user_id).await?;
            None
        } else {
            let perms = UserPermissions::new(user_id, fetched.repo_ids.iter().copied());
            Some(tx.set_user_permissions(&perms).await?)
        };
        for spec in &fetched.linked {
            let granted = tx.grant_pending_permissions(user_id, spec).await?;
            if granted > 0 {
                info!(granted, account_id = %spec.account_id, "Granted pending permissions");
            }
        }
        if !preserve {
            let keep: Vec<RepoId> = fetched.sub_repo.keys().copied().collect();
            let cleared = tx.retain_sub_repo_permissions(user_id, &keep).await?;
            if cleared > 0 {
                debug!(cleared, "Removed stale sub-repo permissions");
            }
            for (repo_id, rules) in &fetched.sub_repo {
                tx.set_sub_repo_permissions(user_id, *repo_id, rules).await?;
            }
        }
        let ids = tx
            .load_user_permissions(user_id)
            .await?
            .map(|p| p.sorted_ids())
            .unwrap_or_default();
        tx.commit().await?;

        if let Some(diff) = &diff {
            debug!(
                added = diff.added,
                removed = diff.removed,
                found = diff.found,
                "Stored user permissions"
            );
        }
        Ok(SyncOutcome {
            ids,
            diff,
            statuses: fetched.statuses
        })
    }

    /// The user's unexpired accounts. With `discover`, every provider is also
    /// asked for an account matching the user, and new ones are saved.
    async fn resolve_accounts(
        &self,
        user: &User,
        providers: &ProviderSet,
        discover: bool
    ) -> PermsSyncResult<Vec<Account>> {
        let mut accounts = self
            .stores
            .accounts
            .list(&ExternalAccountsListOptions {
                user_id: Some(user.id),
                exclude_expired: true,
                ..Default::default()
            })
            .await?;
        if !discover {
            return Ok(accounts);
        }

        let emails = self.stores.users.verified_emails(user.id).await?;
        for provider in providers.iter() {
            let found = self
                .call_provider(
                    provider.urn(),
                    provider.fetch_account(user, &accounts, &emails)
                )
                .await;
            match found {
                Ok(Some(account)) if !accounts.iter().any(|a| a.spec == account.spec) => {
                    let stored = self.stores.accounts.upsert(&account).await?;
                    if !stored.is_expired() {
                        debug!(account_id = stored.id, urn = provider.urn(), "Linked external account");
                        accounts.push(stored);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(urn = provider.urn(), error = %e, "Failed to look up external account");
                }
            }
        }
        Ok(accounts)
    }

    /// Fetches one account's permissions and folds the answer into `fetched`.
    /// Only store failures are returned as errors.
    async fn fetch_account_perms(
        &self,
        provider: &Arc<dyn Provider>,
        account: &Account,
        opts: &FetchPermsOptions,
        fetched: &mut FetchedUserPerms
    ) -> PermsSyncResult<()> {
        let urn = provider.urn();
        let mut result = self
            .call_provider(urn, provider.fetch_user_perms(account, opts))
            .await;

        let unsupported = matches!(&result, Err(e) if e.is_not_implemented());
        if let (true, Some(token)) = (unsupported, account.access_token()) {
            result = self
                .call_provider(urn, provider.fetch_user_perms_by_token(token, opts))
                .await;
        }

        let result: ProviderResult<ExternalUserPermissions> =
            result.and_then(|perms| perms.validate().map(|()| perms));

        match result {
            Ok(perms) => {
                self.stores.accounts.touch_last_valid(account.id).await?;
                fetched
                    .repo_ids
                    .extend(self.resolve_repo_ids(provider.as_ref(), &perms).await?);
                fetched
                    .sub_repo
                    .extend(self.resolve_sub_repo(provider.as_ref(), &perms).await?);
                fetched.linked.push(account.spec.clone());
                fetched.statuses.push_success(urn, provider.service_type());
            }
            Err(e) if e.is_not_implemented() => {
                debug!(urn, "Provider does not support user-centric sync");
            }
            Err(e) if e.invalidates_account() => {
                warn!(account_id = account.id, urn, error = %e, "Marking external account as expired");
                self.stores.accounts.touch_expired(account.id).await?;
                Telemetry::record_account_expired(provider.service_type());
                fetched.statuses.push_error(urn, provider.service_type(), &e);
            }
            Err(e) => {
                warn!(
                    account_id = account.id,
                    urn,
                    temporary = e.is_temporary(),
                    error = %e,
                    "Failed to fetch user permissions"
                );
                Telemetry::record_sync_error(RequestType::User, e.reason());
                fetched.incomplete = true;
                fetched.statuses.push_error(urn, provider.service_type(), &e);
            }
        }
        Ok(())
    }

    /// Maps a provider answer onto local private repository IDs.
    async fn resolve_repo_ids(
        &self,
        provider: &dyn Provider,
        perms: &ExternalUserPermissions
    ) -> PermsSyncResult<BTreeSet<RepoId>> {
        let specs = |ids: &[String]| -> Vec<ExternalRepoSpec> {
            ids.iter()
                .map(|id| external_repo(provider, id))
                .collect()
        };

        let opts = if perms.uses_prefixes() {
            if perms.include_contains.is_empty() {
                return Ok(BTreeSet::new());
            }
            RepoListOptions {
                only_private: true,
                external_repo_include_contains: specs(&perms.include_contains[..]),
                external_repo_exclude_contains: specs(&perms.exclude_contains[..]),
                ..Default::default()
            }
        } else {
            if perms.exacts.is_empty() {
                return Ok(BTreeSet::new());
            }
            RepoListOptions {
                only_private: true,
                external_repos: specs(&perms.exacts[..]),
                ..Default::default()
            }
        };

        let repos = self.stores.repos.list(&opts).await?;
        Ok(repos.into_iter().map(|r| r.id).collect())
    }

    async fn resolve_sub_repo(
        &self,
        provider: &dyn Provider,
        perms: &ExternalUserPermissions
    ) -> PermsSyncResult<BTreeMap<RepoId, SubRepoPermissions>> {
        if perms.sub_repo_permissions.is_empty() {
            return Ok(BTreeMap::new());
        }
        let repos = self
            .stores
            .repos
            .list(&RepoListOptions {
                external_repos: perms
                    .sub_repo_permissions
                    .keys()
                    .map(|id| external_repo(provider, id))
                    .collect(),
                ..Default::default()
            })
            .await?;

        Ok(repos
            .into_iter()
            .filter_map(|repo| {
                perms
                    .sub_repo_permissions
                    .get(&repo.external_repo.id)
                    .map(|rules| (repo.id, rules.clone()))
            })
            .collect())
    }
}

fn external_repo(provider: &dyn Provider, id: &str) -> ExternalRepoSpec {
    ExternalRepoSpec {
        id: id.to_string(),
        service_type: provider.service_type().to_string(),
        service_id: provider.service_id().to_string()
    }
}

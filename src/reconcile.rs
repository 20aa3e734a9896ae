//! The slow reconcile pass: refresh the durable reviewer pool from the
//! ownership files currently checked into a repository.

use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::host::{HostError, IdentityDirectory, SourceHost};
use crate::owners::{parse_owners_file, OWNERS_FILE_NAME};
use crate::store::{Repository, Reviewer, Store, StoreError};

/// Reconcile one repository: resolve its host identifier if unset, re-derive
/// the full alias set referenced by its ownership files, and upsert pool
/// records for every alias. Individual alias-resolution failures are logged
/// and skipped; one bad alias must not abort the cycle.
pub async fn reconcile(
    host: &dyn SourceHost,
    identity: &dyn IdentityDirectory,
    store: &Store,
    repo: &Repository,
) -> Result<()> {
    info!(
        project = %repo.project_name,
        repo = %repo.name,
        "starting reviewer reconcile"
    );

    let repo_id = ensure_external_repo_id(host, store, repo).await?;

    let aliases = collect_reviewer_aliases(host, &repo_id, &repo.project_name).await?;
    info!(count = aliases.len(), "collected reviewer aliases");

    for alias in &aliases {
        if let Err(e) = ensure_reviewer(identity, store, alias).await {
            // Tolerated: the alias stays unresolved until a later cycle.
            warn!(alias = %alias, error = %e, "failed to reconcile reviewer");
        }
    }

    store
        .stamp_repository_reconciled(&repo.project_name, &repo.name, Utc::now())
        .await
        .context("failed to stamp repository as reconciled")?;

    info!(
        project = %repo.project_name,
        repo = %repo.name,
        "finished reviewer reconcile"
    );
    Ok(())
}

/// Resolve and persist the repository's host identifier if it is not yet
/// known. A repository that cannot be found under its project is a
/// misconfiguration and fails the cycle loudly.
async fn ensure_external_repo_id(
    host: &dyn SourceHost,
    store: &Store,
    repo: &Repository,
) -> Result<String> {
    if !repo.external_repo_id.is_empty() {
        return Ok(repo.external_repo_id.clone());
    }

    let remotes = host
        .list_repositories(&repo.project_name)
        .await
        .context("failed to list project repositories")?;

    match remotes.into_iter().find(|r| r.name == repo.name) {
        Some(remote) => {
            store
                .set_repository_external_id(&repo.project_name, &repo.name, &remote.external_id)
                .await
                .context("failed to persist repository id")?;
            info!(repo = %repo.name, external_id = %remote.external_id, "resolved repository id");
            Ok(remote.external_id)
        }
        None => bail!(
            "repository {} not found in project {}",
            repo.name,
            repo.project_name
        ),
    }
}

/// Union of every owner alias referenced by the repository's ownership
/// files, with team references expanded into member aliases. Set union means
/// an alias already counted as an owner is not duplicated by its team.
async fn collect_reviewer_aliases(
    host: &dyn SourceHost,
    repo_id: &str,
    project: &str,
) -> Result<BTreeSet<String>> {
    let tree = host
        .list_repository_tree(repo_id)
        .await
        .context("failed to list repository tree")?;

    let mut aliases = BTreeSet::new();
    let mut teams = BTreeSet::new();

    for path in tree.iter().filter(|p| p.ends_with(OWNERS_FILE_NAME)) {
        let content = host
            .get_file_content(repo_id, path)
            .await
            .with_context(|| format!("failed to fetch ownership file {path}"))?;

        let group = parse_owners_file(&content);
        aliases.extend(group.owners);
        teams.extend(group.teams);
    }

    for team in &teams {
        let members = host
            .list_team_members(project, team)
            .await
            .with_context(|| format!("failed to list members of team {team}"))?;
        aliases.extend(members);
    }

    Ok(aliases)
}

/// Make sure one alias has a pool record with a resolved external identity.
async fn ensure_reviewer(
    identity: &dyn IdentityDirectory,
    store: &Store,
    alias: &str,
) -> Result<()> {
    match store.get_reviewer(alias).await {
        Ok(reviewer) if reviewer.external_id.is_empty() => {
            let external_id = resolve_alias(identity, alias).await?;
            store
                .upsert_reviewer(Reviewer {
                    external_id,
                    ..reviewer
                })
                .await?;
            info!(alias, "back-filled reviewer identity");
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(StoreError::NotFound) => {
            let external_id = resolve_alias(identity, alias).await?;
            store
                .upsert_reviewer(Reviewer::new(alias, external_id))
                .await?;
            info!(alias, "added new reviewer to the pool");
            Ok(())
        }
        Err(e) => Err(e).context("failed to look up reviewer"),
    }
}

async fn resolve_alias(identity: &dyn IdentityDirectory, alias: &str) -> Result<String> {
    match identity.resolve_alias(alias).await {
        Ok(id) => Ok(id),
        Err(HostError::NotFound) => bail!("alias {alias} has no identity in the host"),
        Err(e) => Err(e).context("identity lookup failed"),
    }
}

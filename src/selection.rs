//! Reviewer selection from the durable pool.

use std::collections::BTreeSet;

use tracing::debug;

use crate::store::{Reviewer, Store, StoreError};

/// Outcome of one selection pass for a pull request.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// The chosen owner, marked required on the host. `None` only when the
    /// pull request touches no owned paths.
    pub required: Option<Reviewer>,
    /// The chosen team member. `None` when the owned paths declare no teams,
    /// or when every team member is already an owner.
    pub optional: Option<Reviewer>,
}

/// Pick one required reviewer from the owner pool and one optional reviewer
/// from the team-member pool, by LRU rotation.
///
/// An owner never simultaneously occupies the optional slot: every required
/// owner is removed from the team-member pool before selection, so one
/// person is never double-counted. An empty or fully-overlapping optional
/// pool is valid and yields no optional reviewer.
pub async fn select_reviewers(
    store: &Store,
    required_owners: &BTreeSet<String>,
    team_members: &BTreeSet<String>,
) -> Result<Selection, StoreError> {
    let optional_pool: Vec<String> = team_members
        .difference(required_owners)
        .cloned()
        .collect();

    let required = if required_owners.is_empty() {
        debug!("no required owners declared; leaving required slot empty");
        None
    } else {
        let owners: Vec<String> = required_owners.iter().cloned().collect();
        Some(store.pop_lru_reviewer(owners).await?)
    };

    let optional = match store.pop_lru_reviewer(optional_pool).await {
        Ok(reviewer) => Some(reviewer),
        Err(StoreError::NotFound) => None,
        Err(e) => return Err(e),
    };

    Ok(Selection { required, optional })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aliases(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    async fn store_with(reviewers: &[&str]) -> Store {
        let store = Store::new_in_memory().expect("should create store");
        for alias in reviewers {
            store
                .upsert_reviewer(Reviewer::new(*alias, format!("ext-{alias}")))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_selects_one_from_each_pool() {
        let store = store_with(&["alice", "dave", "erin"]).await;

        let selection = select_reviewers(
            &store,
            &aliases(&["alice"]),
            &aliases(&["dave", "erin"]),
        )
        .await
        .unwrap();

        assert_eq!(selection.required.unwrap().alias, "alice");
        let optional = selection.optional.unwrap().alias;
        assert!(optional == "dave" || optional == "erin");
    }

    #[tokio::test]
    async fn test_owner_never_fills_both_slots() {
        // "bob" is an owner and the only team member; the optional slot must
        // stay empty rather than reusing him.
        let store = store_with(&["bob"]).await;

        let selection =
            select_reviewers(&store, &aliases(&["bob"]), &aliases(&["bob"]))
                .await
                .unwrap();

        assert_eq!(selection.required.unwrap().alias, "bob");
        assert!(selection.optional.is_none());
    }

    #[tokio::test]
    async fn test_overlapping_pools_yield_distinct_reviewers() {
        let store = store_with(&["alice", "bob", "carol"]).await;

        let selection = select_reviewers(
            &store,
            &aliases(&["alice", "bob"]),
            &aliases(&["alice", "bob", "carol"]),
        )
        .await
        .unwrap();

        let required = selection.required.unwrap().alias;
        let optional = selection.optional.unwrap().alias;
        assert_ne!(required, optional);
        assert_eq!(optional, "carol");
    }

    #[tokio::test]
    async fn test_empty_team_pool_is_not_an_error() {
        let store = store_with(&["alice"]).await;

        let selection = select_reviewers(&store, &aliases(&["alice"]), &BTreeSet::new())
            .await
            .unwrap();

        assert!(selection.required.is_some());
        assert!(selection.optional.is_none());
    }

    #[tokio::test]
    async fn test_empty_required_pool_skips_required_slot() {
        let store = store_with(&["dave"]).await;

        let selection = select_reviewers(&store, &BTreeSet::new(), &aliases(&["dave"]))
            .await
            .unwrap();

        assert!(selection.required.is_none());
        assert_eq!(selection.optional.unwrap().alias, "dave");
    }

    #[tokio::test]
    async fn test_unknown_required_owners_propagate_not_found() {
        let store = store_with(&[]).await;

        let result = select_reviewers(&store, &aliases(&["ghost"]), &BTreeSet::new()).await;
        assert!(matches!(result, Err(StoreError::NotFound)));
    }
}

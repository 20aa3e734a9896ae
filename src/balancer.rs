//! The fast balance pass: assign reviewers to newly eligible pull requests.
//!
//! Each open pull request moves through: filters -> already-marked check ->
//! owner resolution -> selection -> apply reviewers -> marker comment ->
//! triggers. The marker comment is the idempotence guard: a pull request
//! whose threads already contain the bot identifier is never re-processed.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::host::{PullRequestView, SourceHost};
use crate::owners::resolve_required_groups;
use crate::reconcile::reconcile;
use crate::selection::{select_reviewers, Selection};
use crate::store::{Repository, Store};
use crate::triggers::ReviewerTrigger;
use crate::AppState;

/// Returns true if a pull request should be skipped entirely.
pub type Filter = Box<dyn Fn(&PullRequestView) -> bool + Send + Sync>;

/// Work-in-progress pull requests and pull requests not targeting the
/// default branch are skipped with no state change.
pub fn default_filters(default_target_branch: &str) -> Vec<Filter> {
    let target_branch = default_target_branch.to_string();
    vec![
        Box::new(|pr: &PullRequestView| pr.title.contains("WIP")),
        Box::new(move |pr: &PullRequestView| {
            !pr.target_branch.eq_ignore_ascii_case(&target_branch)
        }),
    ]
}

pub struct Balancer {
    host: Arc<dyn SourceHost>,
    store: Store,
    bot_identifier: String,
    filters: Vec<Filter>,
    triggers: Vec<Arc<dyn ReviewerTrigger>>,
    exclude_pr_author: bool,
}

impl Balancer {
    pub fn new(
        host: Arc<dyn SourceHost>,
        store: Store,
        bot_identifier: impl Into<String>,
        filters: Vec<Filter>,
        triggers: Vec<Arc<dyn ReviewerTrigger>>,
        exclude_pr_author: bool,
    ) -> Self {
        Self {
            host,
            store,
            bot_identifier: bot_identifier.into(),
            filters,
            triggers,
            exclude_pr_author,
        }
    }

    /// Balance every open pull request of one repository. A failure on one
    /// pull request is logged and does not stop the others; the next poll
    /// cycle retries it.
    pub async fn run(&self, repo: &Repository) -> Result<()> {
        if repo.external_repo_id.is_empty() {
            warn!(
                repo = %repo.name,
                "repository id not yet reconciled; skipping balance pass"
            );
            return Ok(());
        }

        let pull_requests = self
            .host
            .list_open_pull_requests(&repo.external_repo_id)
            .await
            .context("failed to list open pull requests")?;

        for pr in &pull_requests {
            if self.should_filter(pr) {
                continue;
            }

            if let Err(e) = self.balance_pull_request(&repo.project_name, pr).await {
                error!(pr_id = pr.id, error = %e, "failed to balance pull request");
            }
        }

        Ok(())
    }

    fn should_filter(&self, pr: &PullRequestView) -> bool {
        self.filters.iter().any(|filter| filter(pr))
    }

    async fn balance_pull_request(&self, project: &str, pr: &PullRequestView) -> Result<()> {
        if self.contains_balancer_comment(pr).await? {
            return Ok(());
        }

        let groups = resolve_required_groups(self.host.as_ref(), &pr.repository_id, pr.id)
            .await
            .context("failed to resolve owner groups")?;

        let mut required_owners: BTreeSet<String> = BTreeSet::new();
        let mut teams: BTreeSet<String> = BTreeSet::new();
        for group in groups {
            required_owners.extend(group.owners);
            teams.extend(group.teams);
        }

        let mut team_members: BTreeSet<String> = BTreeSet::new();
        for team in &teams {
            let members = self
                .host
                .list_team_members(project, team)
                .await
                .with_context(|| format!("failed to expand team {team}"))?;
            team_members.extend(members);
        }

        if self.exclude_pr_author {
            if let Some(author) = &pr.author_alias {
                required_owners.remove(author);
                team_members.remove(author);
            }
        }

        if required_owners.is_empty() && team_members.is_empty() {
            // No ownership declared for any changed path. Leave the pull
            // request unmarked so owners added later still take effect.
            info!(pr_id = pr.id, "no owners declared; nothing to balance");
            return Ok(());
        }

        let selection = select_reviewers(&self.store, &required_owners, &team_members)
            .await
            .context("failed to select reviewers")?;

        if selection.required.is_none() && selection.optional.is_none() {
            // Candidates exist but none has a pool record yet. Leave the
            // pull request unmarked so the next reconcile makes it eligible.
            info!(pr_id = pr.id, "no selectable reviewers in the pool");
            return Ok(());
        }

        self.apply_selection(pr, &selection).await?;
        self.fire_triggers(pr, &selection).await;

        info!(
            pr_id = pr.id,
            required = selection.required.as_ref().map(|r| r.alias.as_str()),
            optional = selection.optional.as_ref().map(|r| r.alias.as_str()),
            "balanced pull request"
        );
        Ok(())
    }

    /// Whether a previous pass already marked this pull request.
    async fn contains_balancer_comment(&self, pr: &PullRequestView) -> Result<bool> {
        let threads = self
            .host
            .list_comment_threads(&pr.repository_id, pr.id)
            .await
            .context("failed to list comment threads")?;

        Ok(threads.iter().any(|thread| {
            thread
                .comments
                .iter()
                .any(|comment| comment.contains(&self.bot_identifier))
        }))
    }

    /// Apply the chosen reviewers, then post the marker comment. Reviewer
    /// addition is idempotent on the host side, so a crash between the two
    /// steps leaves a pull request that is safe to retry.
    async fn apply_selection(&self, pr: &PullRequestView, selection: &Selection) -> Result<()> {
        if let Some(required) = &selection.required {
            self.host
                .add_reviewer(&pr.repository_id, pr.id, &required.external_id, true)
                .await
                .with_context(|| format!("failed to add required reviewer {}", required.alias))?;
        }

        if let Some(optional) = &selection.optional {
            self.host
                .add_reviewer(&pr.repository_id, pr.id, &optional.external_id, false)
                .await
                .with_context(|| format!("failed to add optional reviewer {}", optional.alias))?;
        }

        let comment = format_reviewer_comment(&self.bot_identifier, selection);
        self.host
            .post_comment(&pr.repository_id, pr.id, &comment)
            .await
            .context("failed to post reviewer comment")?;

        Ok(())
    }

    /// Trigger failures are isolated: the reviewer assignment already
    /// succeeded, so each failure is logged and the rest still run.
    async fn fire_triggers(&self, pr: &PullRequestView, selection: &Selection) {
        let required: Vec<_> = selection.required.iter().cloned().collect();
        let optional: Vec<_> = selection.optional.iter().cloned().collect();

        for trigger in &self.triggers {
            if let Err(e) = trigger.fire(&required, &optional, &pr.url).await {
                error!(trigger = trigger.name(), error = %e, "reviewer trigger failed");
            }
        }
    }
}

/// The comment greets whoever was actually selected: the required owner when
/// there is one, otherwise the optional team member.
fn format_reviewer_comment(bot_identifier: &str, selection: &Selection) -> String {
    let (addressee, role) = match (&selection.required, &selection.optional) {
        (Some(required), _) => (required.alias.as_str(), "required"),
        (None, Some(optional)) => (optional.alias.as_str(), "optional"),
        // Unreachable in practice: the caller skips fully empty selections.
        (None, None) => ("reviewer", "optional"),
    };

    format!(
        "Hello {addressee},\n\n\
         You have been selected as the **{role}** code reviewer of this change.\n\n\
         Your responsibility is to review **each** iteration of this CR until signoff. \
         Please provide no more than a 48 hour SLA for each iteration.\n\n\
         Thank you.\n\n\
         CR Balancer\n\
         {bot_identifier}"
    )
}

/// The fast loop: balance every enabled repository, sequentially, on a fixed
/// cadence. Errors on one repository never stop the cycle.
pub async fn balance_loop(state: Arc<AppState>) {
    let mut interval = interval(Duration::from_secs(state.config.balance_interval_secs));

    loop {
        interval.tick().await;

        if let Err(e) = run_balance_cycle(&state).await {
            error!(error = %e, "balance cycle failed");
        }
    }
}

async fn run_balance_cycle(state: &Arc<AppState>) -> Result<()> {
    let repos = state
        .store
        .list_enabled_repositories()
        .await
        .context("failed to list enabled repositories")?;

    for repo in &repos {
        info!(project = %repo.project_name, repo = %repo.name, "starting balance pass");
        if let Err(e) = state.balancer.run(repo).await {
            error!(repo = %repo.name, error = %e, "balance pass failed");
        }
    }

    Ok(())
}

/// The slow loop: reconcile a repository when its last reconcile is older
/// than the configured period. Ticks hourly so newly registered
/// repositories do not wait a full period for their first reconcile.
pub async fn reconcile_loop(state: Arc<AppState>) {
    let tick_secs = state.config.reconcile_period_secs.min(3600);
    let mut interval = interval(Duration::from_secs(tick_secs.max(1)));

    loop {
        interval.tick().await;

        if let Err(e) = run_reconcile_cycle(&state).await {
            error!(error = %e, "reconcile cycle failed");
        }
    }
}

async fn run_reconcile_cycle(state: &Arc<AppState>) -> Result<()> {
    let repos = state
        .store
        .list_enabled_repositories()
        .await
        .context("failed to list enabled repositories")?;

    let period = chrono::Duration::seconds(state.config.reconcile_period_secs as i64);
    let now = chrono::Utc::now();

    for repo in &repos {
        let stale = match repo.last_reconciled_at {
            None => true,
            Some(at) => at + period < now,
        };
        if !stale {
            continue;
        }

        if let Err(e) = reconcile(
            state.host.as_ref(),
            state.identity.as_ref(),
            &state.store,
            repo,
        )
        .await
        {
            error!(repo = %repo.name, error = %e, "reconcile failed");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Reviewer;

    fn pr(title: &str, target_branch: &str) -> PullRequestView {
        PullRequestView {
            id: 1,
            repository_id: "repo-1".to_string(),
            author_id: "author".to_string(),
            author_alias: None,
            title: title.to_string(),
            target_branch: target_branch.to_string(),
            url: "https://host/pr/1".to_string(),
        }
    }

    #[test]
    fn test_wip_filter() {
        let filters = default_filters("refs/heads/master");
        assert!(filters[0](&pr("WIP: do not review", "refs/heads/master")));
        assert!(!filters[0](&pr("Ready for review", "refs/heads/master")));
    }

    #[test]
    fn test_comment_greets_required_owner() {
        let selection = Selection {
            required: Some(Reviewer::new("alice", "ext-a")),
            optional: Some(Reviewer::new("dave", "ext-d")),
        };

        let comment = format_reviewer_comment("marker-123", &selection);
        assert!(comment.starts_with("Hello alice,"));
        assert!(comment.contains("**required**"));
        assert!(comment.contains("marker-123"));
    }

    #[test]
    fn test_comment_greets_optional_reviewer_when_no_owner_selected() {
        let selection = Selection {
            required: None,
            optional: Some(Reviewer::new("dave", "ext-d")),
        };

        let comment = format_reviewer_comment("marker-123", &selection);
        assert!(comment.starts_with("Hello dave,"));
        assert!(comment.contains("**optional**"));
    }

    #[test]
    fn test_target_branch_filter() {
        let filters = default_filters("refs/heads/master");
        assert!(filters[1](&pr("Ready", "refs/heads/feature")));
        assert!(!filters[1](&pr("Ready", "refs/heads/master")));
        // Case-insensitive branch comparison.
        assert!(!filters[1](&pr("Ready", "refs/heads/MASTER")));
    }
}

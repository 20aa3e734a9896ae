use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

/// Opaque token embedded in every posted comment, used purely to detect
/// already-balanced pull requests. Random-looking so it never collides with
/// ordinary user text.
pub const DEFAULT_BOT_IDENTIFIER: &str = "b03f5f7f11d50a3a";

#[derive(Clone)]
pub struct Config {
    pub organization_url: String,
    pub pat_token: String,
    pub bot_identifier: String,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// Seconds between balance cycles over the enabled repositories.
    pub balance_interval_secs: u64,
    /// A repository is reconciled when its last reconcile is older than this.
    pub reconcile_period_secs: u64,
    /// Pull requests targeting any other branch are skipped.
    pub default_target_branch: String,
    /// When set, the PR author is excluded from both candidate pools rather
    /// than only being deduplicated out of the optional pool.
    pub exclude_pr_author: bool,
    /// Optional chat notification trigger; both must be set to enable it.
    pub chat_webhook_url: Option<String>,
    pub chat_channel: Option<String>,
    /// Optional JSON file mapping aliases to chat handles.
    pub chat_alias_map_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let organization_url = env::var("ADO_ORGANIZATION_URL")
            .context("ADO_ORGANIZATION_URL environment variable is required")?
            .trim_end_matches('/')
            .to_string();

        let pat_token =
            env::var("ADO_PAT_TOKEN").context("ADO_PAT_TOKEN environment variable is required")?;

        let bot_identifier =
            env::var("BOT_IDENTIFIER").unwrap_or_else(|_| DEFAULT_BOT_IDENTIFIER.to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let balance_interval_secs = env::var("BALANCE_INTERVAL_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse::<u64>()
            .context("BALANCE_INTERVAL_SECS must be a valid number")?;

        let reconcile_period_secs = env::var("RECONCILE_PERIOD_SECS")
            .unwrap_or_else(|_| "86400".to_string())
            .parse::<u64>()
            .context("RECONCILE_PERIOD_SECS must be a valid number")?;

        let default_target_branch = env::var("DEFAULT_TARGET_BRANCH")
            .unwrap_or_else(|_| "refs/heads/master".to_string());

        let exclude_pr_author = env::var("EXCLUDE_PR_AUTHOR")
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        let chat_webhook_url = env::var("CHAT_WEBHOOK_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let chat_channel = env::var("CHAT_CHANNEL").ok().filter(|s| !s.trim().is_empty());
        let chat_alias_map_path = env::var("CHAT_ALIAS_MAP_PATH").ok().map(PathBuf::from);

        Ok(Config {
            organization_url,
            pat_token,
            bot_identifier,
            port,
            state_dir,
            balance_interval_secs,
            reconcile_period_secs,
            default_target_branch,
            exclude_pr_author,
            chat_webhook_url,
            chat_channel,
            chat_alias_map_path,
        })
    }
}

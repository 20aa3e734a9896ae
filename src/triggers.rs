//! Post-assignment notification triggers.
//!
//! Triggers run after reviewers are applied to a pull request. Each failure
//! is isolated by the balancer: logged, never propagated, and never allowed
//! to abort the other triggers.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::store::Reviewer;

#[async_trait]
pub trait ReviewerTrigger: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fire(
        &self,
        required: &[Reviewer],
        optional: &[Reviewer],
        pr_url: &str,
    ) -> Result<()>;
}

/// Mentions the selected reviewers in a chat channel via an incoming
/// webhook.
pub struct ChatTrigger {
    client: reqwest::Client,
    webhook_url: String,
    channel: String,
    /// Maps a host alias to a chat handle; aliases without a mapping are
    /// mentioned by alias.
    alias_map: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct AliasMapFile {
    #[serde(flatten)]
    aliases: HashMap<String, String>,
}

impl ChatTrigger {
    pub fn new(webhook_url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
            channel: channel.into(),
            alias_map: HashMap::new(),
        }
    }

    pub fn with_alias_map_file(mut self, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read alias map at {}", path.display()))?;
        let parsed: AliasMapFile =
            serde_json::from_str(&content).context("failed to parse alias map JSON")?;
        self.alias_map = parsed.aliases;
        Ok(self)
    }

    fn mention(&self, reviewer: &Reviewer) -> String {
        let handle = self
            .alias_map
            .get(&reviewer.alias)
            .unwrap_or(&reviewer.alias);
        format!("@{handle}")
    }

    fn format_message(&self, reviewers: &[Reviewer], pr_url: &str) -> String {
        let mentions: Vec<String> = reviewers.iter().map(|r| self.mention(r)).collect();
        format!("{}, you have a PR to review: {}", mentions.join(" "), pr_url)
    }
}

#[async_trait]
impl ReviewerTrigger for ChatTrigger {
    fn name(&self) -> &'static str {
        "chat"
    }

    async fn fire(
        &self,
        required: &[Reviewer],
        optional: &[Reviewer],
        pr_url: &str,
    ) -> Result<()> {
        let mut reviewers = required.to_vec();
        reviewers.extend_from_slice(optional);
        if reviewers.is_empty() {
            return Ok(());
        }

        let message = self.format_message(&reviewers, pr_url);
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&json!({ "channel": self.channel, "text": message }))
            .send()
            .await
            .context("failed to send chat notification")?;

        if !response.status().is_success() {
            anyhow::bail!("chat webhook returned {}", response.status());
        }

        info!(channel = %self.channel, "sent reviewer chat notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reviewer(alias: &str) -> Reviewer {
        Reviewer::new(alias, "")
    }

    #[test]
    fn test_format_message_uses_alias_map() {
        let mut trigger = ChatTrigger::new("https://chat.invalid/hook", "#reviews");
        trigger
            .alias_map
            .insert("alice".to_string(), "alice.w".to_string());

        let msg = trigger.format_message(
            &[reviewer("alice"), reviewer("bob")],
            "https://host/pr/7",
        );
        assert_eq!(msg, "@alice.w @bob, you have a PR to review: https://host/pr/7");
    }

    #[test]
    fn test_format_message_defaults_to_alias() {
        let trigger = ChatTrigger::new("https://chat.invalid/hook", "#reviews");
        let msg = trigger.format_message(&[reviewer("carol")], "url");
        assert!(msg.starts_with("@carol,"));
    }
}

//! REST client for an Azure-DevOps-style source-control host.
//!
//! Thin transport wrapper: every method maps one host endpoint onto the
//! `SourceHost` / `IdentityDirectory` traits. A 404 becomes
//! `HostError::NotFound` (an expected signal for the owners-file walk);
//! every other failure class becomes `HostError::Transport`.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::host::{
    ChangedPathsPage, CommentThread, HostError, IdentityDirectory, PullRequestView,
    RemoteRepository, SourceHost,
};

const API_VERSION: &str = "7.0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AdoClient {
    client: Client,
    organization_url: String,
    auth_header: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestResponse {
    pull_request_id: u64,
    title: String,
    target_ref_name: String,
    created_by: IdentityRefResponse,
    repository: RepositoryRefResponse,
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityRefResponse {
    id: String,
    unique_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RepositoryRefResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct IterationResponse {
    id: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IterationChangesResponse {
    change_entries: Vec<ChangeEntryResponse>,
    next_skip: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChangeEntryResponse {
    item: Option<ChangeItemResponse>,
}

#[derive(Debug, Deserialize)]
struct ChangeItemResponse {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ItemContentResponse {
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TreeItemResponse {
    path: String,
    #[serde(default)]
    is_folder: bool,
}

#[derive(Debug, Deserialize)]
struct ThreadResponse {
    comments: Option<Vec<ThreadCommentResponse>>,
}

#[derive(Debug, Deserialize)]
struct ThreadCommentResponse {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RepositoryResponse {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct TeamMemberResponse {
    identity: Option<TeamMemberIdentityResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TeamMemberIdentityResponse {
    unique_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdentityResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct CreateThreadRequest {
    comments: Vec<CreateCommentRequest>,
}

#[derive(Debug, Serialize)]
struct CreateCommentRequest {
    content: String,
}

impl AdoClient {
    pub fn new(organization_url: impl Into<String>, pat_token: &str) -> Self {
        // Personal access tokens authenticate as basic auth with an empty
        // username.
        let encoded = general_purpose::STANDARD.encode(format!(":{pat_token}"));

        Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
            organization_url: organization_url.into().trim_end_matches('/').to_string(),
            auth_header: format!("Basic {encoded}"),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, HostError> {
        let response = self
            .client
            .get(url)
            .header("Authorization", &self.auth_header)
            .send()
            .await
            .map_err(|e| HostError::Transport(format!("request to {url} failed: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(HostError::NotFound),
            status if status.is_success() => response
                .json()
                .await
                .map_err(|e| HostError::Transport(format!("failed to parse response: {e}"))),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(HostError::Transport(format!(
                    "host returned {status}: {body}"
                )))
            }
        }
    }

    async fn send_json(
        &self,
        builder: reqwest::RequestBuilder,
        body: serde_json::Value,
    ) -> Result<(), HostError> {
        let response = builder
            .header("Authorization", &self.auth_header)
            .header("Content-Type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| HostError::Transport(format!("request failed: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(HostError::NotFound),
            status if status.is_success() => Ok(()),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(HostError::Transport(format!(
                    "host returned {status}: {body}"
                )))
            }
        }
    }

    fn repo_url(&self, repo_id: &str, suffix: &str) -> String {
        format!(
            "{}/_apis/git/repositories/{}/{}",
            self.organization_url, repo_id, suffix
        )
    }

    /// Item-content URL with the path percent-encoded; repository paths can
    /// contain spaces and other characters unsafe in a raw query string.
    fn item_content_url(&self, repo_id: &str, path: &str) -> Result<String, HostError> {
        let mut url = reqwest::Url::parse(&self.repo_url(repo_id, "items"))
            .map_err(|e| HostError::Transport(format!("invalid items url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("includeContent", "true")
            .append_pair("$format", "json")
            .append_pair("api-version", API_VERSION);
        Ok(url.into())
    }
}

#[async_trait]
impl SourceHost for AdoClient {
    async fn list_open_pull_requests(
        &self,
        repo_id: &str,
    ) -> Result<Vec<PullRequestView>, HostError> {
        let url = self.repo_url(
            repo_id,
            &format!("pullrequests?searchCriteria.status=active&api-version={API_VERSION}"),
        );
        let response: ListResponse<PullRequestResponse> = self.get_json(&url).await?;

        info!(
            repo_id,
            count = response.value.len(),
            "listed open pull requests"
        );

        Ok(response
            .value
            .into_iter()
            .map(|pr| PullRequestView {
                id: pr.pull_request_id,
                repository_id: pr.repository.id,
                author_id: pr.created_by.id,
                author_alias: pr
                    .created_by
                    .unique_name
                    .as_deref()
                    .and_then(parse_email_to_alias),
                title: pr.title,
                target_branch: pr.target_ref_name,
                url: pr.url,
            })
            .collect())
    }

    async fn latest_iteration(&self, repo_id: &str, pr_id: u64) -> Result<u32, HostError> {
        let url = self.repo_url(
            repo_id,
            &format!("pullRequests/{pr_id}/iterations?api-version={API_VERSION}"),
        );
        let response: ListResponse<IterationResponse> = self.get_json(&url).await?;

        response
            .value
            .iter()
            .map(|it| it.id)
            .max()
            .ok_or(HostError::NotFound)
    }

    async fn list_changed_paths(
        &self,
        repo_id: &str,
        pr_id: u64,
        iteration: u32,
        skip: u32,
    ) -> Result<ChangedPathsPage, HostError> {
        let url = self.repo_url(
            repo_id,
            &format!(
                "pullRequests/{pr_id}/iterations/{iteration}/changes\
                 ?$skip={skip}&api-version={API_VERSION}"
            ),
        );
        let response: IterationChangesResponse = self.get_json(&url).await?;

        let paths = response
            .change_entries
            .into_iter()
            .filter_map(|entry| entry.item.and_then(|item| item.path))
            .collect();

        Ok(ChangedPathsPage {
            paths,
            next_skip: response.next_skip.unwrap_or(0),
        })
    }

    async fn get_file_content(&self, repo_id: &str, path: &str) -> Result<String, HostError> {
        let url = self.item_content_url(repo_id, path)?;
        let response: ItemContentResponse = self.get_json(&url).await?;
        Ok(response.content)
    }

    async fn list_comment_threads(
        &self,
        repo_id: &str,
        pr_id: u64,
    ) -> Result<Vec<CommentThread>, HostError> {
        let url = self.repo_url(
            repo_id,
            &format!("pullRequests/{pr_id}/threads?api-version={API_VERSION}"),
        );
        let response: ListResponse<ThreadResponse> = self.get_json(&url).await?;

        Ok(response
            .value
            .into_iter()
            .map(|thread| CommentThread {
                comments: thread
                    .comments
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|c| c.content)
                    .collect(),
            })
            .collect())
    }

    async fn post_comment(
        &self,
        repo_id: &str,
        pr_id: u64,
        text: &str,
    ) -> Result<(), HostError> {
        let url = self.repo_url(
            repo_id,
            &format!("pullRequests/{pr_id}/threads?api-version={API_VERSION}"),
        );
        let request = CreateThreadRequest {
            comments: vec![CreateCommentRequest {
                content: text.to_string(),
            }],
        };

        info!(repo_id, pr_id, "posting reviewer comment");
        self.send_json(
            self.client.post(&url),
            serde_json::to_value(&request)
                .map_err(|e| HostError::Transport(format!("failed to encode comment: {e}")))?,
        )
        .await
    }

    async fn add_reviewer(
        &self,
        repo_id: &str,
        pr_id: u64,
        external_id: &str,
        required: bool,
    ) -> Result<(), HostError> {
        // PUT on the reviewer resource is an upsert: re-adding an existing
        // reviewer is a no-op, which keeps retries safe.
        let url = self.repo_url(
            repo_id,
            &format!("pullRequests/{pr_id}/reviewers/{external_id}?api-version={API_VERSION}"),
        );

        info!(repo_id, pr_id, external_id, required, "adding reviewer");
        self.send_json(
            self.client.put(&url),
            json!({ "vote": 0, "isRequired": required }),
        )
        .await
    }

    async fn list_repository_tree(&self, repo_id: &str) -> Result<Vec<String>, HostError> {
        let url = self.repo_url(
            repo_id,
            &format!("items?recursionLevel=full&api-version={API_VERSION}"),
        );
        let response: ListResponse<TreeItemResponse> = self.get_json(&url).await?;

        Ok(response
            .value
            .into_iter()
            .filter(|item| !item.is_folder)
            .map(|item| item.path)
            .collect())
    }

    async fn list_repositories(
        &self,
        project: &str,
    ) -> Result<Vec<RemoteRepository>, HostError> {
        let url = format!(
            "{}/{}/_apis/git/repositories?api-version={}",
            self.organization_url, project, API_VERSION
        );
        let response: ListResponse<RepositoryResponse> = self.get_json(&url).await?;

        Ok(response
            .value
            .into_iter()
            .map(|repo| RemoteRepository {
                name: repo.name,
                external_id: repo.id,
            })
            .collect())
    }

    async fn list_team_members(
        &self,
        project: &str,
        team: &str,
    ) -> Result<Vec<String>, HostError> {
        let url = format!(
            "{}/_apis/projects/{}/teams/{}/members?api-version={}",
            self.organization_url, project, team, API_VERSION
        );
        let response: ListResponse<TeamMemberResponse> = self.get_json(&url).await?;

        Ok(response
            .value
            .into_iter()
            .filter_map(|member| member.identity)
            .filter_map(|identity| {
                identity
                    .unique_name
                    .as_deref()
                    .and_then(parse_email_to_alias)
            })
            .collect())
    }
}

#[async_trait]
impl IdentityDirectory for AdoClient {
    async fn resolve_alias(&self, alias: &str) -> Result<String, HostError> {
        let url = format!(
            "{}/_apis/identities?searchFilter=General&filterValue={}&api-version={}",
            self.organization_url, alias, API_VERSION
        );
        let response: ListResponse<IdentityResponse> = self.get_json(&url).await?;

        response
            .value
            .into_iter()
            .next()
            .map(|identity| identity.id)
            .ok_or(HostError::NotFound)
    }
}

/// The alias half of `alias@domain`; `None` for anything else.
fn parse_email_to_alias(email: &str) -> Option<String> {
    let mut parts = email.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(alias), Some(_), None) if !alias.trim().is_empty() => {
            Some(alias.trim().to_string())
        }
        _ => None,
    }
}

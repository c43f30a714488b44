//! GitLab webhook payloads and their normalization into build requests

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::build::{BranchInfo, PullRequestInfo, RequestType};
use crate::error::NormalizeError;

/// Stand-in commit message for pushes that carry no commit entries.
pub const NO_MESSAGE: &str = "no message provided";

pub const SERVICE: &str = "gitlab";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    MergeRequest,
    Push,
}

impl EventKind {
    /// Parse the `X-Gitlab-Event` header value.
    pub fn from_header(value: &str) -> Option<Self> {
        match value {
            "Merge Request Hook" => Some(EventKind::MergeRequest),
            "Push Hook" => Some(EventKind::Push),
            _ => None,
        }
    }

    /// Parse the payload's `object_kind` field.
    pub fn from_object_kind(value: &str) -> Option<Self> {
        match value {
            "merge_request" => Some(EventKind::MergeRequest),
            "push" => Some(EventKind::Push),
            _ => None,
        }
    }
}

/// One inbound webhook delivery
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

/// Uniform build request derived from any event type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedRequest {
    #[serde(rename = "type")]
    pub kind: RequestType,
    pub service: String,
    pub owner: String,
    pub repo: String,
    pub repo_id: u64,
    pub slug: String,
    pub sha: String,
    pub commit_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Merge request events other than `opened`.
    MergeRequestState(String),
    /// Push whose latest commit message lacks the build marker.
    NoBuildMarker,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::MergeRequestState(state) => {
                write!(f, "merge request state is '{}', not 'opened'", state)
            }
            SkipReason::NoBuildMarker => write!(f, "latest commit has no build marker"),
        }
    }
}

/// Result of normalizing an event: either a request to build, or a filtered event.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Request(NormalizedRequest),
    Skip(SkipReason),
}

#[derive(Debug, Default, Deserialize)]
struct ProjectPayload {
    id: Option<u64>,
    path_with_namespace: Option<String>,
    web_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CommitPayload {
    id: Option<String>,
    message: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MergeRequestAttributes {
    id: Option<u64>,
    iid: Option<u64>,
    title: Option<String>,
    description: Option<String>,
    source_branch: Option<String>,
    url: Option<String>,
    last_commit: Option<CommitPayload>,
    source: Option<ProjectPayload>,
}

#[derive(Debug, Deserialize)]
struct MergeRequestPayload {
    project: Option<ProjectPayload>,
    object_attributes: Option<MergeRequestAttributes>,
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    reference: Option<String>,
    after: Option<String>,
    project: Option<ProjectPayload>,
    commits: Option<Vec<CommitPayload>>,
}

/// The repository identity shared by every request type
struct RepoIdentity {
    owner: String,
    repo: String,
    repo_id: u64,
    slug: String,
    web_url: String,
}

impl RepoIdentity {
    fn from_project(project: Option<ProjectPayload>) -> Result<Self, NormalizeError> {
        let project = project.ok_or(NormalizeError::MissingField("project"))?;
        let slug = project
            .path_with_namespace
            .filter(|s| !s.is_empty())
            .ok_or(NormalizeError::MissingField("project.path_with_namespace"))?;
        let (owner, repo) = slug
            .rsplit_once('/')
            .ok_or_else(|| NormalizeError::Malformed(format!("unexpected project path '{}'", slug)))?;

        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            repo_id: project.id.unwrap_or_default(),
            web_url: project.web_url.unwrap_or_default(),
            slug,
        })
    }
}

fn parse<T: DeserializeOwned>(payload: &serde_json::Value) -> Result<T, NormalizeError> {
    T::deserialize(payload).map_err(|e| NormalizeError::Malformed(e.to_string()))
}

/// Turns raw webhook payloads into [`NormalizedRequest`]s, filtering out
/// events that must not produce a build.
#[derive(Debug, Clone)]
pub struct Normalizer {
    build_marker: String,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new("[build]")
    }
}

impl Normalizer {
    pub fn new(build_marker: impl Into<String>) -> Self {
        Self {
            build_marker: build_marker.into(),
        }
    }

    pub fn normalize(&self, event: &WebhookEvent) -> Result<Normalized, NormalizeError> {
        match event.kind {
            EventKind::MergeRequest => self.normalize_merge_request(&event.payload),
            EventKind::Push => self.normalize_push(&event.payload),
        }
    }

    /// Only `opened` merge requests are built.
    pub fn normalize_merge_request(
        &self,
        payload: &serde_json::Value,
    ) -> Result<Normalized, NormalizeError> {
        // Filter on the raw state, before the typed parse.
        let state = payload
            .pointer("/object_attributes/state")
            .and_then(|s| s.as_str())
            .unwrap_or_default();
        if state != "opened" {
            debug!(state = %state, "merge request not opened, skipping");
            return Ok(Normalized::Skip(SkipReason::MergeRequestState(
                state.to_string(),
            )));
        }

        let payload: MergeRequestPayload = parse(payload)?;
        let attrs = payload.object_attributes.unwrap_or_default();

        let identity = RepoIdentity::from_project(payload.project)?;
        let commit = attrs
            .last_commit
            .ok_or(NormalizeError::MissingField("object_attributes.last_commit"))?;
        let sha = commit
            .id
            .filter(|s| !s.is_empty())
            .ok_or(NormalizeError::MissingField("object_attributes.last_commit.id"))?;
        let branch_name = attrs
            .source_branch
            .ok_or(NormalizeError::MissingField("object_attributes.source_branch"))?;
        let source_url = attrs
            .source
            .and_then(|s| s.web_url)
            .unwrap_or_else(|| identity.web_url.clone());
        let iid = attrs
            .iid
            .ok_or(NormalizeError::MissingField("object_attributes.iid"))?;

        Ok(Normalized::Request(NormalizedRequest {
            kind: RequestType::PullRequest,
            service: SERVICE.to_string(),
            commit_url: commit
                .url
                .unwrap_or_else(|| format!("{}/commit/{}", identity.web_url, sha)),
            branch: Some(BranchInfo {
                html_url: format!("{}/tree/{}", source_url, branch_name),
                name: branch_name,
            }),
            pull_request: Some(PullRequestInfo {
                number: iid,
                id: attrs.id.unwrap_or_default(),
                name: attrs.title.unwrap_or_default(),
                description: attrs.description.unwrap_or_default(),
                html_url: attrs.url.unwrap_or_default(),
            }),
            message: commit.message,
            sha,
            owner: identity.owner,
            repo: identity.repo,
            repo_id: identity.repo_id,
            slug: identity.slug,
        }))
    }

    /// Pushes are built only when the latest commit message carries the
    /// build marker.
    pub fn normalize_push(&self, payload: &serde_json::Value) -> Result<Normalized, NormalizeError> {
        let payload: PushPayload = parse(payload)?;

        let reference = payload
            .reference
            .ok_or(NormalizeError::MissingField("ref"))?;
        let branch_name = reference
            .strip_prefix("refs/heads/")
            .unwrap_or(&reference)
            .to_string();

        let after = payload.after.unwrap_or_default();
        let commits = payload.commits.unwrap_or_default();
        let latest = commits
            .iter()
            .find(|c| c.id.as_deref() == Some(after.as_str()))
            .or_else(|| commits.last());

        let message = latest
            .and_then(|c| c.message.clone())
            .unwrap_or_else(|| NO_MESSAGE.to_string());

        if !message.contains(&self.build_marker) {
            debug!(branch = %branch_name, "no build marker in latest commit, skipping");
            return Ok(Normalized::Skip(SkipReason::NoBuildMarker));
        }

        if after.is_empty() {
            return Err(NormalizeError::MissingField("after"));
        }

        let identity = RepoIdentity::from_project(payload.project)?;
        let commit_url = latest
            .and_then(|c| c.url.clone())
            .unwrap_or_else(|| format!("{}/commit/{}", identity.web_url, after));

        Ok(Normalized::Request(NormalizedRequest {
            kind: RequestType::Branch,
            service: SERVICE.to_string(),
            commit_url,
            branch: Some(BranchInfo {
                html_url: format!("{}/tree/{}", identity.web_url, branch_name),
                name: branch_name,
            }),
            pull_request: None,
            message: Some(message),
            sha: after,
            owner: identity.owner,
            repo: identity.repo,
            repo_id: identity.repo_id,
            slug: identity.slug,
        }))
    }
}

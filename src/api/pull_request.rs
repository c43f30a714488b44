//! Merge request lookup endpoint

use axum::{
    Json,
    extract::{Path, Query, State as AxumState},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::SharedState;
use crate::gitlab::{MergeRequest, Session};

#[derive(Debug, Deserialize)]
pub struct PullRequestQuery {
    /// Overrides the configured default API token
    pub token: Option<String>,
}

/// Merge request info in the shape the coordinator expects
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestSummary {
    pub id: u64,
    pub number: u64,
    pub state: String,
    pub name: String,
    pub description: String,
    pub html_url: String,
    pub branch: String,
    pub target_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    pub owner: String,
    pub repo: String,
    pub service: String,
}

impl PullRequestSummary {
    fn new(owner: String, repo: String, mr: MergeRequest) -> Self {
        Self {
            id: mr.id,
            number: mr.iid,
            state: mr.state,
            name: mr.title,
            description: mr.description.unwrap_or_default(),
            html_url: mr.web_url,
            branch: mr.source_branch,
            target_branch: mr.target_branch,
            sha: mr.sha,
            owner,
            repo,
            service: crate::webhook::SERVICE.to_string(),
        }
    }
}

/// GET /pull-request/{owner}/{repo}/{pull_request_number}
pub async fn get_pull_request(
    AxumState(state): AxumState<SharedState>,
    Path((owner, repo, number)): Path<(String, String, u64)>,
    Query(params): Query<PullRequestQuery>,
) -> Response {
    let session = Session::new(
        state.config.gitlab.base_url.clone(),
        params.token.or_else(|| state.config.gitlab.api_token.clone()),
    );
    let project = format!("{}/{}", owner, repo);

    match state
        .pipeline
        .gitlab()
        .get_merge_request(&session, &project, number)
        .await
    {
        Ok(mr) => Json(PullRequestSummary::new(owner, repo, mr)).into_response(),
        Err(e) => {
            error!(project = %project, number, "Merge request lookup failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.message() })),
            )
                .into_response()
        }
    }
}

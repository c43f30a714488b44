//! Status callbacks from the build system, relayed to GitLab as commit statuses

use axum::{
    Json,
    extract::{Path, State as AxumState},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error};

use crate::SharedState;
use crate::build::Project;
use crate::error::StatusError;
use crate::status::StatusUpdate;

#[derive(Debug, Deserialize)]
pub struct CommitTarget {
    #[serde(rename = "ref")]
    pub reference: String,
}

/// The build a status belongs to, as sent by the coordinator
#[derive(Debug, Deserialize)]
pub struct BuildTarget {
    pub project: Project,
    pub commit: CommitTarget,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub update: StatusUpdate,
    pub build: BuildTarget,
}

async fn relay(state: &SharedState, request: StatusRequest) -> Response {
    let StatusRequest { update, build } = request;

    match state
        .pipeline
        .post_status(&build.project, &build.commit.reference, &update)
        .await
    {
        Ok(info) => Json(info).into_response(),
        Err(e @ StatusError::UnknownState(_)) => {
            debug!("Rejected status update: {}", e);
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response()
        }
        Err(e) => {
            error!(sha = %build.commit.reference, "Status update failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// POST /update
pub async fn post_update(
    AxumState(state): AxumState<SharedState>,
    Json(request): Json<StatusRequest>,
) -> Response {
    relay(&state, request).await
}

/// POST /builds/{bid}/status/{context} - the path context overrides the body's
pub async fn post_build_status(
    AxumState(state): AxumState<SharedState>,
    Path((bid, context)): Path<(String, String)>,
    Json(mut request): Json<StatusRequest>,
) -> Response {
    debug!(build = %bid, context = %context, "Status update for build");
    request.update.context = context;
    relay(&state, request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support;
    use crate::error::ProviderError;
    use crate::fakes::{FakeCoordinator, FakeGitLab};
    use crate::status::{CommitState, StatusInfo};
    use axum::body::to_bytes;
    use std::sync::Arc;

    fn request(state: &str, description: &str) -> StatusRequest {
        serde_json::from_value(json!({
            "update": {
                "state": state,
                "description": description,
                "context": "ci/tests",
                "target_url": "http://x"
            },
            "build": {
                "project": {
                    "id": "p1",
                    "slug": "group/app",
                    "owner": "group",
                    "repo": "app",
                    "service": "gitlab",
                    "serviceAuth": {"token": "project-token"}
                },
                "commit": {"ref": "abc123"}
            }
        }))
        .unwrap()
    }

    async fn body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn long_description_is_posted_once_truncated() {
        let gitlab = Arc::new(FakeGitLab::new());
        let state = test_support::state(gitlab.clone(), Arc::new(FakeCoordinator::new()));

        let response = post_update(
            AxumState(state),
            Json(request("success", &"d".repeat(200))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let posted = gitlab.statuses();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].sha, "abc123");
        assert_eq!(posted[0].project, "group/app");
        assert_eq!(posted[0].token.as_deref(), Some("project-token"));
        assert_eq!(posted[0].status.description.chars().count(), 140);
        assert_eq!(posted[0].status.state, CommitState::Success);

        let info: StatusInfo = serde_json::from_value(body(response).await).unwrap();
        assert_eq!(info, posted[0].status);
    }

    #[tokio::test]
    async fn path_context_wins() {
        let gitlab = Arc::new(FakeGitLab::new());
        let state = test_support::state(gitlab.clone(), Arc::new(FakeCoordinator::new()));

        let response = post_build_status(
            AxumState(state),
            Path(("b1".to_string(), "ci/lint".to_string())),
            Json(request("failure", "lint failed")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let posted = gitlab.statuses();
        assert_eq!(posted[0].status.context, "ci/lint");
        assert_eq!(posted[0].status.state, CommitState::Failed);
    }

    #[tokio::test]
    async fn unknown_state_is_rejected_before_dispatch() {
        let gitlab = Arc::new(FakeGitLab::new());
        let state = test_support::state(gitlab.clone(), Arc::new(FakeCoordinator::new()));

        let response = post_update(AxumState(state), Json(request("exploded", ""))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(gitlab.statuses().is_empty());
    }

    #[tokio::test]
    async fn dispatch_failure_is_a_500() {
        let gitlab = Arc::new(FakeGitLab::new().with_status_results(vec![Err(
            ProviderError::Api {
                status: 403,
                message: "403 Forbidden".into(),
            },
        )]));
        let state = test_support::state(gitlab, Arc::new(FakeCoordinator::new()));

        let response = post_update(AxumState(state), Json(request("running", ""))).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let value = body(response).await;
        assert!(value["error"].as_str().unwrap().contains("403 Forbidden"));
    }

    #[tokio::test]
    async fn transition_conflict_is_reported_as_posted() {
        let gitlab = Arc::new(FakeGitLab::new().with_status_results(vec![Err(
            ProviderError::Api {
                status: 400,
                message: "Cannot transition status via :run from :running".into(),
            },
        )]));
        let state = test_support::state(gitlab, Arc::new(FakeCoordinator::new()));

        let response = post_update(AxumState(state), Json(request("running", "again"))).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}

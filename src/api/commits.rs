//! Explicit commit build endpoint

use axum::{
    Json,
    extract::{Path, State as AxumState},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, info};

use crate::SharedState;
use crate::error::{CoordinatorError, PipelineError};
use crate::pipeline::Outcome;

/// POST /commits/{owner}/{repo}/{sha}/build
pub async fn build_commit(
    AxumState(state): AxumState<SharedState>,
    Path((owner, repo, sha)): Path<(String, String, String)>,
) -> Response {
    info!(owner = %owner, repo = %repo, sha = %sha, "Commit build requested");

    match state.pipeline.build_commit(&owner, &repo, &sha).await {
        Ok(Outcome::Submitted { build, response }) => {
            Json(json!({ "ok": true, "build": build, "response": response })).into_response()
        }
        Ok(Outcome::ConfigFailed { error, .. }) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "ok": false, "error": error.to_string() })),
        )
            .into_response(),
        Ok(_) => Json(json!({ "ok": true })).into_response(),
        Err(e @ PipelineError::Coordinator(CoordinatorError::ProjectNotFound { .. })) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "ok": false, "error": e.to_string() })),
        )
            .into_response(),
        Err(e) => {
            error!(sha = %sha, "Commit build failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

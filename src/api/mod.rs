//! API module for all HTTP handlers

pub mod commits;
pub mod pull_request;
pub mod status;
pub mod webhook;

use axum::{Json, Router, extract::State as AxumState, routing};
use serde_json::json;

use crate::SharedState;

// Re-export handlers
pub use commits::build_commit;
pub use pull_request::get_pull_request;
pub use status::{post_build_status, post_update};
pub use webhook::handle_webhook;

/// Root health check endpoint
pub async fn root(AxumState(state): AxumState<SharedState>) -> Json<serde_json::Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "started_at": state.started_at,
        "uptime_seconds": state.start_time.elapsed().as_secs(),
    }))
}

/// Build the router for every endpoint the bridge exposes.
pub fn router(state: SharedState) -> Router {
    let webhook_path = state.config.server.webhook_path.clone();

    Router::new()
        .route("/", routing::get(root))
        .route(&webhook_path, routing::post(handle_webhook))
        .route("/update", routing::post(post_update))
        .route("/builds/{bid}/status/{context}", routing::post(post_build_status))
        .route(
            "/pull-request/{owner}/{repo}/{pull_request_number}",
            routing::get(get_pull_request),
        )
        .route("/commits/{owner}/{repo}/{sha}/build", routing::post(build_commit))
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::fakes::{FakeCoordinator, FakeGitLab, RecordingAlertSink};
    use crate::{AppState, SharedState, parse_config};

    pub const CONFIG: &str = r#"
[gitlab]
base_url = "https://gitlab.example.com"
client_id = "abc"
redirect_uri = "https://bridge.example.com/oauth"
api_token = "default-token"

[coordinator]
url = "http://localhost:3010"
"#;

    pub fn state(gitlab: Arc<FakeGitLab>, coordinator: Arc<FakeCoordinator>) -> SharedState {
        let config = parse_config(CONFIG).unwrap();
        Arc::new(
            AppState::with_collaborators(
                config,
                gitlab,
                coordinator,
                Arc::new(RecordingAlertSink::default()),
            )
            .unwrap(),
        )
    }
}

//! Webhook handler for GitLab merge request and push events

use axum::{
    Json,
    body::Bytes,
    extract::Query,
    extract::State as AxumState,
    http::{HeaderMap, StatusCode},
};
use serde_json::json;
use std::collections::HashMap;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::SharedState;
use crate::pipeline::Outcome;
use crate::webhook::{EventKind, WebhookEvent};

type Ack = (StatusCode, Json<serde_json::Value>);

/// GitLab redelivers on anything but success, so every delivery is
/// acknowledged whatever happens downstream.
fn ack() -> Ack {
    (StatusCode::OK, Json(json!({ "ok": true })))
}

/// Handles the GitLab webhook POST request.
pub async fn handle_webhook(
    AxumState(state): AxumState<SharedState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Ack {
    // Check for dry run mode
    let dry_run = params.get("dry_run").map(|v| v == "true").unwrap_or(false)
        || headers.get("X-Dry-Run").is_some();

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!("Could not parse webhook body: {}", e);
            return ack();
        }
    };

    let header_kind = headers.get("X-Gitlab-Event").and_then(|v| v.to_str().ok());
    let kind = header_kind.and_then(EventKind::from_header).or_else(|| {
        payload
            .get("object_kind")
            .and_then(|k| k.as_str())
            .and_then(EventKind::from_object_kind)
    });
    let Some(kind) = kind else {
        info!("Ignoring unsupported webhook event {:?}", header_kind);
        return ack();
    };

    let delivery = Uuid::now_v7();
    let span = info_span!("webhook", %delivery, ?kind);
    let event = WebhookEvent { kind, payload };
    let shared_state = state.clone();

    // Spawn a background task so GitLab gets its answer right away
    tokio::spawn(
        async move {
            match shared_state.pipeline.handle_event(&event, dry_run).await {
                Ok(Outcome::Submitted { build, response }) => {
                    info!(sha = %build.commit.reference, "Build accepted: {}", response);
                }
                Ok(Outcome::ConfigFailed { error, status }) => {
                    warn!("No build submitted: {}", error);
                    if let Err(e) = status {
                        error!("Could not report config failure: {}", e);
                    }
                }
                Ok(Outcome::Filtered(reason)) => debug!("Filtered: {}", reason),
                Ok(Outcome::DryRun(_)) => {}
                Err(e) => error!("Webhook processing failed: {}", e),
            }
        }
        .instrument(span),
    );

    ack()
}

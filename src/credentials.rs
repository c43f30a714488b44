//! Health check and refresh of the GitLab OAuth token stored on a project

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::alert::{Alert, AlertSink};
use crate::build::{Project, ServiceAuth};
use crate::coordinator::CoordinatorApi;
use crate::error::CredentialRefreshError;
use crate::gitlab::{GitLabApi, OAuthClient, Session};

pub const DEFAULT_PROBE_ATTEMPTS: usize = 5;

#[derive(Clone)]
pub struct CredentialManager {
    gitlab: Arc<dyn GitLabApi>,
    coordinator: Arc<dyn CoordinatorApi>,
    alerts: Arc<dyn AlertSink>,
    oauth: OAuthClient,
    default_base_url: String,
    probe_attempts: usize,
}

impl CredentialManager {
    pub fn new(
        gitlab: Arc<dyn GitLabApi>,
        coordinator: Arc<dyn CoordinatorApi>,
        alerts: Arc<dyn AlertSink>,
        oauth: OAuthClient,
        default_base_url: impl Into<String>,
    ) -> Self {
        Self {
            gitlab,
            coordinator,
            alerts,
            oauth,
            default_base_url: default_base_url.into(),
            probe_attempts: DEFAULT_PROBE_ATTEMPTS,
        }
    }

    pub fn with_probe_attempts(mut self, attempts: usize) -> Self {
        self.probe_attempts = attempts;
        self
    }

    /// Return auth material for `project` that is known to work, refreshing
    /// it when every probe fails.
    ///
    /// A failed refresh is alerted on and the original material is returned
    /// unchanged, so the request carries on with what it had.
    pub async fn ensure_usable_token(&self, project: &Project) -> Option<ServiceAuth> {
        let auth = project.service_auth.clone()?;
        let base_url = project.base_url(&self.default_base_url).to_string();

        if self.probe(&base_url, &auth.token).await {
            return Some(auth);
        }

        warn!(
            slug = %project.slug,
            attempts = self.probe_attempts,
            "GitLab token failed every probe, refreshing"
        );

        match self.refresh(project, &base_url, &auth).await {
            Ok(fresh) => Some(fresh),
            Err(e) => {
                self.alerts
                    .alert(Alert::new(
                        "GitLab token refresh failed",
                        e.to_string(),
                        json!({
                            "project": project.id,
                            "slug": project.slug,
                            "organization": project.organization_key(),
                            "baseUrl": base_url,
                            "probeAttempts": self.probe_attempts,
                        }),
                    ))
                    .await;
                Some(auth)
            }
        }
    }

    /// Up to `probe_attempts` calls, stopping at the first HTTP 200.
    async fn probe(&self, base_url: &str, token: &str) -> bool {
        let session = Session::new(base_url, Some(token.to_string()));
        for attempt in 1..=self.probe_attempts {
            match self.gitlab.probe_token(&session).await {
                Ok(200) => {
                    debug!(attempt, "GitLab token is usable");
                    return true;
                }
                Ok(code) => debug!(attempt, code, "GitLab token probe rejected"),
                Err(e) => debug!(attempt, "GitLab token probe failed: {}", e),
            }
        }
        false
    }

    async fn refresh(
        &self,
        project: &Project,
        base_url: &str,
        auth: &ServiceAuth,
    ) -> Result<ServiceAuth, CredentialRefreshError> {
        let refresh_token = auth
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(CredentialRefreshError::MissingRefreshToken)?;

        let pair = self
            .gitlab
            .refresh_token(base_url, &self.oauth, refresh_token)
            .await?;
        let fresh = ServiceAuth {
            token: pair.access_token,
            refresh_token: Some(pair.refresh_token),
        };
        info!(slug = %project.slug, "Refreshed GitLab token");

        // The old refresh token is spent now, so the new pair is used even
        // if the coordinator cannot store it.
        if let Err(e) = self
            .coordinator
            .update_tokens(project.organization_key(), &fresh)
            .await
        {
            self.alerts
                .alert(Alert::new(
                    "Refreshed GitLab token not stored",
                    CredentialRefreshError::Persist(e).to_string(),
                    json!({
                        "project": project.id,
                        "organization": project.organization_key(),
                    }),
                ))
                .await;
        }

        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CoordinatorError, ProviderError};
    use crate::fakes::{FakeCoordinator, FakeGitLab, RecordingAlertSink};
    use crate::gitlab::TokenPair;

    fn project() -> Project {
        Project {
            id: "p1".into(),
            slug: "group/app".into(),
            owner: "group".into(),
            repo: "app".into(),
            service: "gitlab".into(),
            organization_id: Some("org1".into()),
            service_auth: Some(ServiceAuth {
                token: "old-token".into(),
                refresh_token: Some("old-refresh".into()),
            }),
            ..Default::default()
        }
    }

    fn oauth() -> OAuthClient {
        OAuthClient {
            client_id: "client".into(),
            client_secret: None,
            redirect_uri: "https://bridge.example.com/oauth".into(),
        }
    }

    struct Harness {
        gitlab: Arc<FakeGitLab>,
        coordinator: Arc<FakeCoordinator>,
        alerts: Arc<RecordingAlertSink>,
        manager: CredentialManager,
    }

    fn harness(gitlab: FakeGitLab, coordinator: FakeCoordinator) -> Harness {
        let gitlab = Arc::new(gitlab);
        let coordinator = Arc::new(coordinator);
        let alerts = Arc::new(RecordingAlertSink::default());
        let manager = CredentialManager::new(
            gitlab.clone(),
            coordinator.clone(),
            alerts.clone(),
            oauth(),
            "https://gitlab.example.com",
        );
        Harness {
            gitlab,
            coordinator,
            alerts,
            manager,
        }
    }

    fn fresh_pair() -> TokenPair {
        TokenPair {
            access_token: "new-token".into(),
            refresh_token: "new-refresh".into(),
        }
    }

    #[tokio::test]
    async fn stops_probing_at_first_success() {
        let h = harness(
            FakeGitLab::new().with_probe_results(vec![Ok(401), Ok(200), Ok(200)]),
            FakeCoordinator::new(),
        );
        let auth = h.manager.ensure_usable_token(&project()).await.unwrap();

        assert_eq!(auth.token, "old-token");
        assert_eq!(h.gitlab.probe_count(), 2);
        assert!(h.gitlab.refresh_requests().is_empty());
    }

    #[tokio::test]
    async fn refreshes_after_five_failed_probes() {
        let h = harness(
            FakeGitLab::new()
                .with_probe_results(vec![Ok(401); 10])
                .with_refresh_result(Ok(fresh_pair())),
            FakeCoordinator::new(),
        );
        let auth = h.manager.ensure_usable_token(&project()).await.unwrap();

        assert_eq!(h.gitlab.probe_count(), 5);
        assert_eq!(h.gitlab.refresh_requests(), vec!["old-refresh".to_string()]);
        assert_eq!(auth.token, "new-token");
        assert_eq!(auth.refresh_token.as_deref(), Some("new-refresh"));
        assert_eq!(
            h.coordinator.token_updates(),
            vec![("org1".to_string(), auth.clone())]
        );
        assert!(h.alerts.alerts().is_empty());
    }

    #[tokio::test]
    async fn probe_transport_errors_count_as_failures() {
        let h = harness(
            FakeGitLab::new()
                .with_probe_results(vec![Err(ProviderError::Transport("timed out".into())); 5])
                .with_refresh_result(Ok(fresh_pair())),
            FakeCoordinator::new(),
        );
        let auth = h.manager.ensure_usable_token(&project()).await.unwrap();
        assert_eq!(auth.token, "new-token");
    }

    #[tokio::test]
    async fn failed_refresh_keeps_original_material_and_alerts() {
        let h = harness(
            FakeGitLab::new()
                .with_probe_results(vec![Ok(401); 5])
                .with_refresh_result(Err(ProviderError::Api {
                    status: 400,
                    message: "invalid_grant".into(),
                })),
            FakeCoordinator::new(),
        );
        let original = project();
        let auth = h.manager.ensure_usable_token(&original).await;

        assert_eq!(auth, original.service_auth);
        assert!(h.coordinator.token_updates().is_empty());
        let alerts = h.alerts.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].context["slug"], "group/app");
    }

    #[tokio::test]
    async fn missing_refresh_token_alerts() {
        let h = harness(
            FakeGitLab::new().with_probe_results(vec![Ok(401); 5]),
            FakeCoordinator::new(),
        );
        let mut p = project();
        p.service_auth.as_mut().unwrap().refresh_token = None;

        let auth = h.manager.ensure_usable_token(&p).await.unwrap();
        assert_eq!(auth.token, "old-token");
        assert!(h.gitlab.refresh_requests().is_empty());
        assert_eq!(h.alerts.alerts().len(), 1);
    }

    #[tokio::test]
    async fn unstored_refresh_is_still_used() {
        let h = harness(
            FakeGitLab::new()
                .with_probe_results(vec![Ok(401); 5])
                .with_refresh_result(Ok(fresh_pair())),
            FakeCoordinator::new()
                .with_token_update_error(CoordinatorError::Transport("refused".into())),
        );
        let auth = h.manager.ensure_usable_token(&project()).await.unwrap();
        assert_eq!(auth.token, "new-token");
        assert_eq!(h.alerts.alerts().len(), 1);
    }

    #[tokio::test]
    async fn project_without_auth_is_left_alone() {
        let h = harness(FakeGitLab::new(), FakeCoordinator::new());
        let mut p = project();
        p.service_auth = None;
        assert!(h.manager.ensure_usable_token(&p).await.is_none());
        assert_eq!(h.gitlab.probe_count(), 0);
    }
}

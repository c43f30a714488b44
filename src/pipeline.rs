//! Ties normalization, project lookup, credentials, config resolution,
//! build submission and status dispatch together

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::build::{Build, Project, RequestType};
use crate::config_resolver::ConfigResolver;
use crate::coordinator::CoordinatorApi;
use crate::credentials::CredentialManager;
use crate::error::{ConfigError, PipelineError, StatusError};
use crate::gitlab::{GitLabApi, Session};
use crate::status::{StatusDispatcher, StatusInfo, StatusTarget, StatusUpdate};
use crate::webhook::{Normalized, NormalizedRequest, Normalizer, SERVICE, SkipReason, WebhookEvent};

pub const DEFAULT_CONFIG_ERROR_CONTEXT: &str = "ProboCI/env";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Base URL for projects that do not carry their own.
    pub default_base_url: String,
    /// Status context used to report config resolution failures.
    pub config_error_context: String,
}

/// What happened to one event
#[derive(Debug)]
pub enum Outcome {
    Filtered(SkipReason),
    DryRun(NormalizedRequest),
    Submitted {
        build: Build,
        response: serde_json::Value,
    },
    /// No build was submitted; the failure was reported as a commit status.
    ConfigFailed {
        error: ConfigError,
        status: Result<StatusInfo, StatusError>,
    },
}

/// Owns the collaborators and the single status dispatch queue.
#[derive(Clone)]
pub struct Pipeline {
    normalizer: Normalizer,
    gitlab: Arc<dyn GitLabApi>,
    coordinator: Arc<dyn CoordinatorApi>,
    resolver: ConfigResolver,
    credentials: CredentialManager,
    statuses: StatusDispatcher,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        normalizer: Normalizer,
        gitlab: Arc<dyn GitLabApi>,
        coordinator: Arc<dyn CoordinatorApi>,
        resolver: ConfigResolver,
        credentials: CredentialManager,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            normalizer,
            statuses: StatusDispatcher::new(Arc::clone(&gitlab)),
            gitlab,
            coordinator,
            resolver,
            credentials,
            settings,
        }
    }

    pub fn session_for(&self, project: &Project) -> Session {
        Session::new(
            project.base_url(&self.settings.default_base_url),
            project.token().map(str::to_string),
        )
    }

    /// Process one webhook delivery end to end.
    pub async fn handle_event(
        &self,
        event: &WebhookEvent,
        dry_run: bool,
    ) -> Result<Outcome, PipelineError> {
        let request = match self.normalizer.normalize(event)? {
            Normalized::Skip(reason) => {
                info!("Ignoring {:?} event: {}", event.kind, reason);
                return Ok(Outcome::Filtered(reason));
            }
            Normalized::Request(request) => request,
        };

        if dry_run {
            info!(
                "[DRY_RUN] Would build {} '{}' at {}",
                request.slug,
                request.branch.as_ref().map(|b| b.name.as_str()).unwrap_or("-"),
                request.sha
            );
            return Ok(Outcome::DryRun(request));
        }

        let project = self.find_project(&request.slug).await?;
        self.process(request, project).await
    }

    /// Build an explicit commit of a registered repository.
    pub async fn build_commit(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<Outcome, PipelineError> {
        let mut project = self.find_project(&format!("{}/{}", owner, repo)).await?;
        project.service_auth = self.credentials.ensure_usable_token(&project).await;

        let commit = self
            .gitlab
            .get_commit(&self.session_for(&project), &project.api_id(), sha)
            .await?;

        let request = NormalizedRequest {
            kind: RequestType::Hash,
            service: SERVICE.to_string(),
            owner: project.owner.clone(),
            repo: project.repo.clone(),
            repo_id: project.provider_id.unwrap_or_default(),
            slug: project.slug.clone(),
            commit_url: commit.web_url,
            branch: None,
            pull_request: None,
            message: Some(if commit.title.is_empty() {
                commit.message
            } else {
                commit.title
            }),
            sha: commit.id,
        };
        self.submit(request, project).await
    }

    async fn find_project(&self, slug: &str) -> Result<Project, PipelineError> {
        self.coordinator
            .find_project(SERVICE, slug)
            .await
            .map_err(|e| {
                error!(slug, "Project lookup failed, dropping event: {}", e);
                PipelineError::from(e)
            })
    }

    async fn process(
        &self,
        request: NormalizedRequest,
        mut project: Project,
    ) -> Result<Outcome, PipelineError> {
        project.service_auth = self.credentials.ensure_usable_token(&project).await;
        self.submit(request, project).await
    }

    async fn submit(
        &self,
        request: NormalizedRequest,
        project: Project,
    ) -> Result<Outcome, PipelineError> {
        let session = self.session_for(&project);

        let config = match self
            .resolver
            .resolve(&session, &project.api_id(), &request.sha)
            .await
        {
            Ok(config) => config,
            Err(error) => {
                warn!(slug = %project.slug, sha = %request.sha, "Build config unusable: {}", error);
                let update = StatusUpdate {
                    state: "error".to_string(),
                    description: error.to_string(),
                    context: self.settings.config_error_context.clone(),
                    target_url: None,
                };
                let status = self
                    .statuses
                    .post(session, StatusTarget::for_project(&project, &request.sha), &update)
                    .await;
                return Ok(Outcome::ConfigFailed { error, status });
            }
        };

        let build = Build::new(request, config);
        let response = self.coordinator.submit_build(&project, &build).await?;
        info!(
            slug = %project.slug,
            sha = %build.commit.reference,
            "Submitted {:?} build '{}'",
            build.kind,
            build.name
        );

        Ok(Outcome::Submitted { build, response })
    }

    /// Relay a build-system status update to the commit it belongs to.
    pub async fn post_status(
        &self,
        project: &Project,
        sha: &str,
        update: &StatusUpdate,
    ) -> Result<StatusInfo, StatusError> {
        self.statuses
            .post(
                self.session_for(project),
                StatusTarget::for_project(project, sha),
                update,
            )
            .await
    }

    pub fn gitlab(&self) -> &Arc<dyn GitLabApi> {
        &self.gitlab
    }
}

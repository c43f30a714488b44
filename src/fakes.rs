//! In-memory fakes for the GitLab, coordinator and alert collaborators (testing only)
//!
//! They record every call so tests can assert on call counts and ordering
//! without any network access.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::alert::{Alert, AlertSink};
use crate::build::{Build, Project, ServiceAuth};
use crate::coordinator::CoordinatorApi;
use crate::error::{CoordinatorError, ProviderError};
use crate::gitlab::{
    CommitInfo, GitLabApi, MergeRequest, OAuthClient, RepositoryFile, Session, TokenPair,
};
use crate::status::StatusInfo;

// ---------------------------------------------------------------------------
// FakeGitLab
// ---------------------------------------------------------------------------

/// A status post as seen by [`FakeGitLab`]
#[derive(Debug, Clone, PartialEq)]
pub struct PostedStatus {
    pub project: String,
    pub sha: String,
    pub token: Option<String>,
    pub status: StatusInfo,
}

#[derive(Debug, Default)]
pub struct FakeGitLab {
    files: HashMap<String, Result<RepositoryFile, ProviderError>>,
    commits: HashMap<String, CommitInfo>,
    merge_requests: HashMap<u64, Result<MergeRequest, ProviderError>>,
    status_delays: HashMap<String, Duration>,
    status_results: Mutex<VecDeque<Result<(), ProviderError>>>,
    probe_results: Mutex<VecDeque<Result<u16, ProviderError>>>,
    refresh_result: Option<Result<TokenPair, ProviderError>>,
    file_requests: Mutex<Vec<String>>,
    statuses: Mutex<Vec<PostedStatus>>,
    probes: Mutex<usize>,
    refreshes: Mutex<Vec<String>>,
}

impl FakeGitLab {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `content` (base64-encoded, as GitLab does) at `path`.
    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.with_raw_file(
            path,
            RepositoryFile {
                file_path: path.to_string(),
                content: STANDARD.encode(content),
                encoding: "base64".to_string(),
            },
        )
    }

    pub fn with_raw_file(mut self, path: &str, file: RepositoryFile) -> Self {
        self.files.insert(path.to_string(), Ok(file));
        self
    }

    pub fn with_file_error(mut self, path: &str, err: ProviderError) -> Self {
        self.files.insert(path.to_string(), Err(err));
        self
    }

    pub fn with_commit(mut self, commit: CommitInfo) -> Self {
        self.commits.insert(commit.id.clone(), commit);
        self
    }

    pub fn with_merge_request(mut self, iid: u64, result: Result<MergeRequest, ProviderError>) -> Self {
        self.merge_requests.insert(iid, result);
        self
    }

    /// Delay status posts for `sha` by `delay`.
    pub fn with_status_delay(mut self, sha: &str, delay: Duration) -> Self {
        self.status_delays.insert(sha.to_string(), delay);
        self
    }

    /// Answers for successive status posts; once used up, posts succeed.
    pub fn with_status_results(self, results: Vec<Result<(), ProviderError>>) -> Self {
        *self.status_results.lock().unwrap() = results.into();
        self
    }

    /// Answers for successive token probes; once used up, probes return 200.
    pub fn with_probe_results(self, results: Vec<Result<u16, ProviderError>>) -> Self {
        *self.probe_results.lock().unwrap() = results.into();
        self
    }

    pub fn with_refresh_result(mut self, result: Result<TokenPair, ProviderError>) -> Self {
        self.refresh_result = Some(result);
        self
    }

    pub fn file_requests(&self) -> Vec<String> {
        self.file_requests.lock().unwrap().clone()
    }

    pub fn file_requests_for(&self, path: &str) -> usize {
        self.file_requests
            .lock()
            .unwrap()
            .iter()
            .filter(|p| *p == path)
            .count()
    }

    pub fn statuses(&self) -> Vec<PostedStatus> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn probe_count(&self) -> usize {
        *self.probes.lock().unwrap()
    }

    pub fn refresh_requests(&self) -> Vec<String> {
        self.refreshes.lock().unwrap().clone()
    }
}

#[async_trait]
impl GitLabApi for FakeGitLab {
    async fn get_file(
        &self,
        _session: &Session,
        _project: &str,
        path: &str,
        _reference: &str,
    ) -> Result<RepositoryFile, ProviderError> {
        self.file_requests.lock().unwrap().push(path.to_string());
        self.files
            .get(path)
            .cloned()
            .unwrap_or_else(|| Err(ProviderError::NotFound("404 File Not Found".to_string())))
    }

    async fn get_commit(
        &self,
        _session: &Session,
        _project: &str,
        sha: &str,
    ) -> Result<CommitInfo, ProviderError> {
        self.commits
            .get(sha)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound("404 Commit Not Found".to_string()))
    }

    async fn post_status(
        &self,
        session: &Session,
        project: &str,
        sha: &str,
        status: &StatusInfo,
    ) -> Result<(), ProviderError> {
        if let Some(delay) = self.status_delays.get(sha) {
            tokio::time::sleep(*delay).await;
        }
        self.statuses.lock().unwrap().push(PostedStatus {
            project: project.to_string(),
            sha: sha.to_string(),
            token: session.token.clone(),
            status: status.clone(),
        });
        self.status_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn get_merge_request(
        &self,
        _session: &Session,
        _project: &str,
        iid: u64,
    ) -> Result<MergeRequest, ProviderError> {
        self.merge_requests
            .get(&iid)
            .cloned()
            .unwrap_or_else(|| Err(ProviderError::NotFound("404 Not found".to_string())))
    }

    async fn probe_token(&self, _session: &Session) -> Result<u16, ProviderError> {
        *self.probes.lock().unwrap() += 1;
        self.probe_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(200))
    }

    async fn refresh_token(
        &self,
        _base_url: &str,
        _client: &OAuthClient,
        refresh_token: &str,
    ) -> Result<TokenPair, ProviderError> {
        self.refreshes.lock().unwrap().push(refresh_token.to_string());
        self.refresh_result.clone().unwrap_or_else(|| {
            Err(ProviderError::Api {
                status: 401,
                message: "invalid_grant".to_string(),
            })
        })
    }
}

// ---------------------------------------------------------------------------
// FakeCoordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FakeCoordinator {
    projects: HashMap<String, Project>,
    submit_error: Option<CoordinatorError>,
    token_update_error: Option<CoordinatorError>,
    builds: Mutex<Vec<(Project, Build)>>,
    token_updates: Mutex<Vec<(String, ServiceAuth)>>,
}

impl FakeCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(mut self, project: Project) -> Self {
        self.projects.insert(project.slug.clone(), project);
        self
    }

    pub fn with_submit_error(mut self, err: CoordinatorError) -> Self {
        self.submit_error = Some(err);
        self
    }

    pub fn with_token_update_error(mut self, err: CoordinatorError) -> Self {
        self.token_update_error = Some(err);
        self
    }

    pub fn builds(&self) -> Vec<(Project, Build)> {
        self.builds.lock().unwrap().clone()
    }

    pub fn token_updates(&self) -> Vec<(String, ServiceAuth)> {
        self.token_updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl CoordinatorApi for FakeCoordinator {
    async fn find_project(&self, service: &str, slug: &str) -> Result<Project, CoordinatorError> {
        self.projects
            .get(slug)
            .filter(|p| p.service == service)
            .cloned()
            .ok_or_else(|| CoordinatorError::ProjectNotFound {
                service: service.to_string(),
                slug: slug.to_string(),
            })
    }

    async fn submit_build(
        &self,
        project: &Project,
        build: &Build,
    ) -> Result<serde_json::Value, CoordinatorError> {
        if let Some(err) = &self.submit_error {
            return Err(err.clone());
        }
        let mut builds = self.builds.lock().unwrap();
        builds.push((project.clone(), build.clone()));
        Ok(serde_json::json!({ "id": format!("build-{}", builds.len()) }))
    }

    async fn update_tokens(
        &self,
        organization_id: &str,
        auth: &ServiceAuth,
    ) -> Result<(), CoordinatorError> {
        if let Some(err) = &self.token_update_error {
            return Err(err.clone());
        }
        self.token_updates
            .lock()
            .unwrap()
            .push((organization_id.to_string(), auth.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingAlertSink
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn alert(&self, alert: Alert) {
        self.alerts.lock().unwrap().push(alert);
    }
}

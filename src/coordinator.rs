//! Build coordinator REST API collaborator

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::build::{Build, Project, ServiceAuth};
use crate::error::CoordinatorError;

#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    /// Find the project registered for a repository.
    async fn find_project(&self, service: &str, slug: &str) -> Result<Project, CoordinatorError>;

    async fn submit_build(
        &self,
        project: &Project,
        build: &Build,
    ) -> Result<serde_json::Value, CoordinatorError>;

    /// Store a refreshed token pair for an organization.
    async fn update_tokens(
        &self,
        organization_id: &str,
        auth: &ServiceAuth,
    ) -> Result<(), CoordinatorError>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProjectLookup {
    Many(Vec<Project>),
    One(Project),
}

#[derive(Clone)]
pub struct CoordinatorClient {
    http: reqwest::Client,
    base_url: String,
}

impl CoordinatorClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CoordinatorError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoordinatorError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, CoordinatorError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(CoordinatorError::Api {
            status: status.as_u16(),
            message: if body.is_empty() {
                format!("HTTP {}", status)
            } else {
                body
            },
        })
    }
}

#[async_trait]
impl CoordinatorApi for CoordinatorClient {
    async fn find_project(&self, service: &str, slug: &str) -> Result<Project, CoordinatorError> {
        let not_found = || CoordinatorError::ProjectNotFound {
            service: service.to_string(),
            slug: slug.to_string(),
        };
        debug!(service, slug, "looking up project");

        let response = self
            .http
            .get(format!("{}/projects", self.base_url))
            .query(&[("service", service), ("slug", slug), ("single", "true")])
            .send()
            .await
            .map_err(|e| CoordinatorError::Transport(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(not_found());
        }

        let lookup = Self::check(response)
            .await?
            .json::<Option<ProjectLookup>>()
            .await
            .map_err(|e| CoordinatorError::Transport(e.to_string()))?;

        match lookup {
            Some(ProjectLookup::One(project)) => Ok(project),
            Some(ProjectLookup::Many(projects)) => projects.into_iter().next().ok_or_else(not_found),
            None => Err(not_found()),
        }
    }

    async fn submit_build(
        &self,
        project: &Project,
        build: &Build,
    ) -> Result<serde_json::Value, CoordinatorError> {
        let response = self
            .http
            .post(format!("{}/startbuild", self.base_url))
            .json(&json!({ "project": project, "build": build }))
            .send()
            .await
            .map_err(|e| CoordinatorError::Transport(e.to_string()))?;

        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| CoordinatorError::Transport(e.to_string()))
    }

    async fn update_tokens(
        &self,
        organization_id: &str,
        auth: &ServiceAuth,
    ) -> Result<(), CoordinatorError> {
        let response = self
            .http
            .put(format!(
                "{}/organizations/{}/service-auth",
                self.base_url, organization_id
            ))
            .json(auth)
            .send()
            .await
            .map_err(|e| CoordinatorError::Transport(e.to_string()))?;

        Self::check(response).await?;
        Ok(())
    }
}

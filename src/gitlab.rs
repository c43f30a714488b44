//! GitLab REST API collaborator

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProviderError;
use crate::status::StatusInfo;

/// Where and as whom a GitLab call is made
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub base_url: String,
    pub token: Option<String>,
}

impl Session {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token,
        }
    }
}

/// `GET /projects/:id/repository/files/:path`
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct RepositoryFile {
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub encoding: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct CommitInfo {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub web_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct MergeRequest {
    pub id: u64,
    pub iid: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub source_branch: String,
    #[serde(default)]
    pub target_branch: String,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub web_url: String,
}

/// OAuth client registration used to refresh project tokens
#[derive(Debug, Clone, PartialEq)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[async_trait]
pub trait GitLabApi: Send + Sync {
    async fn get_file(
        &self,
        session: &Session,
        project: &str,
        path: &str,
        reference: &str,
    ) -> Result<RepositoryFile, ProviderError>;

    async fn get_commit(
        &self,
        session: &Session,
        project: &str,
        sha: &str,
    ) -> Result<CommitInfo, ProviderError>;

    async fn post_status(
        &self,
        session: &Session,
        project: &str,
        sha: &str,
        status: &StatusInfo,
    ) -> Result<(), ProviderError>;

    async fn get_merge_request(
        &self,
        session: &Session,
        project: &str,
        iid: u64,
    ) -> Result<MergeRequest, ProviderError>;

    /// Issue one authenticated request and report the HTTP status code.
    async fn probe_token(&self, session: &Session) -> Result<u16, ProviderError>;

    async fn refresh_token(
        &self,
        base_url: &str,
        client: &OAuthClient,
        refresh_token: &str,
    ) -> Result<TokenPair, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Pull a readable message out of a GitLab error body.
fn error_message(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            message: Some(serde_json::Value::String(m)),
            ..
        }) => m,
        Ok(ErrorBody {
            message: Some(other),
            ..
        }) => other.to_string(),
        Ok(ErrorBody {
            error_description: Some(d),
            ..
        }) => d,
        Ok(ErrorBody { error: Some(e), .. }) => e,
        _ if !body.is_empty() => body.to_string(),
        _ => format!("HTTP {}", status),
    }
}

/// Map a non-success answer to an error, keeping GitLab's own message.
/// A 404 stays distinguishable so callers can treat it as "absent".
fn status_error(status: StatusCode, body: &str) -> ProviderError {
    let message = error_message(status, body);
    if status == StatusCode::NOT_FOUND {
        ProviderError::NotFound(message)
    } else {
        ProviderError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

/// reqwest-backed GitLab v4 client
#[derive(Clone)]
pub struct GitLabClient {
    http: reqwest::Client,
}

impl GitLabClient {
    pub fn new(timeout: Duration) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("gitlab_build_bridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self { http })
    }

    /// Build `<base>/api/v4/<segments...>`, percent-encoding each segment.
    fn api_url(base_url: &str, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = Url::parse(base_url)
            .map_err(|e| ProviderError::Transport(format!("invalid base url '{}': {}", base_url, e)))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ProviderError::Transport(format!("invalid base url '{}'", base_url)))?;
            path.pop_if_empty().push("api").push("v4");
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn authorize(request: reqwest::RequestBuilder, session: &Session) -> reqwest::RequestBuilder {
        match &session.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, ProviderError> {
        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(what, status = status.as_u16(), "GitLab request rejected");
            return Err(status_error(status, &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

#[async_trait]
impl GitLabApi for GitLabClient {
    async fn get_file(
        &self,
        session: &Session,
        project: &str,
        path: &str,
        reference: &str,
    ) -> Result<RepositoryFile, ProviderError> {
        let mut url = Self::api_url(
            &session.base_url,
            &["projects", project, "repository", "files", path],
        )?;
        url.query_pairs_mut().append_pair("ref", reference);
        debug!(project, path, reference, "fetching repository file");

        let request = Self::authorize(self.http.get(url), session);
        self.send(request, path).await
    }

    async fn get_commit(
        &self,
        session: &Session,
        project: &str,
        sha: &str,
    ) -> Result<CommitInfo, ProviderError> {
        let url = Self::api_url(
            &session.base_url,
            &["projects", project, "repository", "commits", sha],
        )?;
        let request = Self::authorize(self.http.get(url), session);
        self.send(request, sha).await
    }

    async fn post_status(
        &self,
        session: &Session,
        project: &str,
        sha: &str,
        status: &StatusInfo,
    ) -> Result<(), ProviderError> {
        let url = Self::api_url(&session.base_url, &["projects", project, "statuses", sha])?;
        let body = serde_json::json!({
            "state": status.state,
            "description": status.description,
            "name": status.context,
            "target_url": status.target_url,
        });
        debug!(project, sha, state = %status.state, context = %status.context, "posting commit status");

        let request = Self::authorize(self.http.post(url), session).json(&body);
        self.send::<serde_json::Value>(request, sha).await?;
        Ok(())
    }

    async fn get_merge_request(
        &self,
        session: &Session,
        project: &str,
        iid: u64,
    ) -> Result<MergeRequest, ProviderError> {
        let iid = iid.to_string();
        let url = Self::api_url(
            &session.base_url,
            &["projects", project, "merge_requests", &iid],
        )?;
        let request = Self::authorize(self.http.get(url), session);
        self.send(request, &format!("{}!{}", project, iid)).await
    }

    async fn probe_token(&self, session: &Session) -> Result<u16, ProviderError> {
        let url = Self::api_url(&session.base_url, &["user"])?;
        let response = Self::authorize(self.http.get(url), session)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(response.status().as_u16())
    }

    async fn refresh_token(
        &self,
        base_url: &str,
        client: &OAuthClient,
        refresh_token: &str,
    ) -> Result<TokenPair, ProviderError> {
        let url = format!("{}/oauth/token", base_url.trim_end_matches('/'));
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client.client_id.as_str()),
            ("redirect_uri", client.redirect_uri.as_str()),
        ];
        if let Some(secret) = &client.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        self.send(self.http.post(url).form(&form), "oauth/token").await
    }
}

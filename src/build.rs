//! Coordinator-side records: projects and the builds submitted for them

use serde::{Deserialize, Serialize};

use crate::webhook::NormalizedRequest;

/// Stored OAuth material for talking to GitLab on a project's behalf
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAuth {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// A project as the coordinator knows it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<u64>,
    pub slug: String,
    pub owner: String,
    pub repo: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_auth: Option<ServiceAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderInfo>,
}

impl Project {
    /// Identifier used in GitLab `/projects/:id` URLs: the numeric id when
    /// known, otherwise the `owner/repo` path.
    pub fn api_id(&self) -> String {
        match self.provider_id {
            Some(id) => id.to_string(),
            None if !self.slug.is_empty() => self.slug.clone(),
            None => format!("{}/{}", self.owner, self.repo),
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.service_auth.as_ref().map(|a| a.token.as_str())
    }

    /// GitLab base URL for this project, falling back to `default`.
    pub fn base_url<'a>(&'a self, default: &'a str) -> &'a str {
        self.provider
            .as_ref()
            .and_then(|p| p.base_url.as_deref())
            .filter(|u| !u.is_empty())
            .unwrap_or(default)
    }

    /// Id used when storing refreshed tokens at the coordinator.
    pub fn organization_key(&self) -> &str {
        self.organization_id.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    PullRequest,
    Branch,
    Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BranchInfo {
    pub name: String,
    pub html_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestInfo {
    pub number: u64,
    pub id: u64,
    pub name: String,
    pub description: String,
    pub html_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommitRef {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub html_url: String,
}

/// A build as submitted to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub commit: CommitRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestInfo>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RequestType,
    pub config: serde_json::Value,
}

impl Build {
    pub fn new(request: NormalizedRequest, config: serde_json::Value) -> Self {
        let name = match (&request.pull_request, &request.message) {
            (Some(pr), _) => pr.name.clone(),
            (None, Some(message)) => message.lines().next().unwrap_or_default().to_string(),
            (None, None) => request.sha.clone(),
        };

        Self {
            commit: CommitRef {
                reference: request.sha,
                html_url: request.commit_url,
            },
            branch: request.branch,
            pull_request: request.pull_request,
            name,
            kind: request.kind,
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn project() -> Project {
        Project {
            id: "p1".into(),
            slug: "group/app".into(),
            owner: "group".into(),
            repo: "app".into(),
            service: "gitlab".into(),
            ..Default::default()
        }
    }

    #[test]
    fn api_id_prefers_provider_id() {
        let mut p = project();
        assert_eq!(p.api_id(), "group/app");
        p.provider_id = Some(42);
        assert_eq!(p.api_id(), "42");
    }

    #[test]
    fn base_url_falls_back_to_default() {
        let mut p = project();
        assert_eq!(p.base_url("https://gitlab.com"), "https://gitlab.com");
        p.provider = Some(ProviderInfo {
            base_url: Some("https://git.example.org".into()),
        });
        assert_eq!(p.base_url("https://gitlab.com"), "https://git.example.org");
    }

    #[test]
    fn project_reads_coordinator_json() {
        let p: Project = serde_json::from_value(json!({
            "id": "p1",
            "providerId": 7,
            "slug": "group/app",
            "owner": "group",
            "repo": "app",
            "service": "gitlab",
            "serviceAuth": {"token": "t", "refreshToken": "r"}
        }))
        .unwrap();
        assert_eq!(p.token(), Some("t"));
        assert_eq!(
            p.service_auth.unwrap().refresh_token.as_deref(),
            Some("r")
        );
        assert_eq!(p.provider_id, Some(7));
    }

    #[test]
    fn build_serializes_with_coordinator_field_names() {
        let request = NormalizedRequest {
            kind: RequestType::Branch,
            service: "gitlab".into(),
            owner: "group".into(),
            repo: "app".into(),
            repo_id: 7,
            slug: "group/app".into(),
            sha: "abc123".into(),
            commit_url: "https://gitlab.com/group/app/commit/abc123".into(),
            branch: Some(BranchInfo {
                name: "main".into(),
                html_url: "https://gitlab.com/group/app/tree/main".into(),
            }),
            pull_request: None,
            message: Some("Fix it [build]\n\nbody".into()),
        };
        let build = Build::new(request, json!({"steps": []}));
        let value = serde_json::to_value(&build).unwrap();
        assert_eq!(value["commit"]["ref"], "abc123");
        assert_eq!(value["type"], "branch");
        assert_eq!(value["name"], "Fix it [build]");
        assert!(value.get("pullRequest").is_none());
    }
}

//! Locates and parses the per-commit build configuration file

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, info};

use crate::error::{ConfigError, ProviderError};
use crate::gitlab::{GitLabApi, RepositoryFile, Session};

pub const DEFAULT_CONFIG_FILE: &str = ".probo.yml";
pub const DEFAULT_FALLBACK_CONFIG_FILE: &str = ".probo.yaml";

/// Decode a repository file and parse it as YAML.
///
/// Errors carry the file path and the underlying message verbatim:
/// `Failed to parse <path>: <message>`.
pub fn parse_config(path: &str, file: &RepositoryFile) -> Result<serde_json::Value, ConfigError> {
    let parse_error = |message: String| ConfigError::Parse {
        path: path.to_string(),
        message,
    };

    let text = if file.encoding.is_empty() || file.encoding == "base64" {
        let compact: String = file.content.split_whitespace().collect();
        let bytes = STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| parse_error(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| parse_error(e.to_string()))?
    } else {
        file.content.clone()
    };

    serde_yaml::from_str::<serde_json::Value>(&text).map_err(|e| parse_error(e.to_string()))
}

/// Tries the primary config file name, then the fallback name.
#[derive(Clone)]
pub struct ConfigResolver {
    gitlab: Arc<dyn GitLabApi>,
    primary: String,
    fallback: String,
}

impl ConfigResolver {
    pub fn new(
        gitlab: Arc<dyn GitLabApi>,
        primary: impl Into<String>,
        fallback: impl Into<String>,
    ) -> Self {
        Self {
            gitlab,
            primary: primary.into(),
            fallback: fallback.into(),
        }
    }

    pub fn with_default_paths(gitlab: Arc<dyn GitLabApi>) -> Self {
        Self::new(gitlab, DEFAULT_CONFIG_FILE, DEFAULT_FALLBACK_CONFIG_FILE)
    }

    /// `Ok(None)` means the file is absent or empty; anything else from
    /// GitLab is an upstream failure.
    async fn fetch(
        &self,
        session: &Session,
        project: &str,
        path: &str,
        sha: &str,
    ) -> Result<Option<RepositoryFile>, ProviderError> {
        match self.gitlab.get_file(session, project, path, sha).await {
            Ok(file) if file.content.trim().is_empty() => Ok(None),
            Ok(file) => Ok(Some(file)),
            Err(ProviderError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Resolve the build configuration for `sha`.
    ///
    /// The fallback file is only consulted when the primary one is missing;
    /// an upstream error on the primary lookup is returned as is.
    pub async fn resolve(
        &self,
        session: &Session,
        project: &str,
        sha: &str,
    ) -> Result<serde_json::Value, ConfigError> {
        for path in [&self.primary, &self.fallback] {
            if let Some(file) = self.fetch(session, project, path, sha).await? {
                info!(project, sha, path = %path, "Found build config");
                return parse_config(path, &file);
            }
            debug!(project, sha, path = %path, "No build config at path");
        }
        Err(ConfigError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeGitLab;
    use serde_json::json;

    const GOOD: &str = "image: proboci/ubuntu\nsteps:\n  - name: test\n    command: make test\n";

    fn session() -> Session {
        Session::new("https://gitlab.example.com", Some("token".into()))
    }

    #[tokio::test]
    async fn primary_file_wins_without_touching_fallback() {
        let gitlab = Arc::new(
            FakeGitLab::new()
                .with_file(".probo.yml", GOOD)
                .with_file(".probo.yaml", "other: true\n"),
        );
        let resolver = ConfigResolver::with_default_paths(gitlab.clone());

        let config = resolver.resolve(&session(), "group/app", "abc123").await.unwrap();
        assert_eq!(config["image"], "proboci/ubuntu");
        assert_eq!(gitlab.file_requests(), vec![".probo.yml".to_string()]);
    }

    #[tokio::test]
    async fn missing_primary_falls_back() {
        let gitlab = Arc::new(FakeGitLab::new().with_file(".probo.yaml", GOOD));
        let resolver = ConfigResolver::with_default_paths(gitlab.clone());

        let config = resolver.resolve(&session(), "group/app", "abc123").await.unwrap();
        let direct: serde_json::Value = serde_yaml::from_str(GOOD).unwrap();
        assert_eq!(config, direct);
        assert_eq!(
            gitlab.file_requests(),
            vec![".probo.yml".to_string(), ".probo.yaml".to_string()]
        );
    }

    #[tokio::test]
    async fn empty_primary_counts_as_missing() {
        let gitlab = Arc::new(
            FakeGitLab::new()
                .with_raw_file(".probo.yml", RepositoryFile::default())
                .with_file(".probo.yaml", GOOD),
        );
        let resolver = ConfigResolver::with_default_paths(gitlab);
        let config = resolver.resolve(&session(), "group/app", "abc123").await.unwrap();
        assert_eq!(config["steps"][0]["name"], "test");
    }

    #[tokio::test]
    async fn upstream_error_skips_fallback() {
        let upstream = ProviderError::Api {
            status: 500,
            message: "Internal Server Error".into(),
        };
        let gitlab = Arc::new(
            FakeGitLab::new()
                .with_file_error(".probo.yml", upstream.clone())
                .with_file(".probo.yaml", GOOD),
        );
        let resolver = ConfigResolver::with_default_paths(gitlab.clone());

        let err = resolver.resolve(&session(), "group/app", "abc123").await.unwrap_err();
        assert_eq!(err, ConfigError::Upstream(upstream));
        assert_eq!(gitlab.file_requests_for(".probo.yaml"), 0);
    }

    #[tokio::test]
    async fn no_file_anywhere() {
        let resolver = ConfigResolver::with_default_paths(Arc::new(FakeGitLab::new()));
        let err = resolver.resolve(&session(), "group/app", "abc123").await.unwrap_err();
        assert_eq!(err, ConfigError::NotFound);
        assert_eq!(err.to_string(), "No config file was found.");
    }

    #[tokio::test]
    async fn parse_error_names_the_file() {
        let bad = "image: proboci/ubuntu\nsteps:\n\t- name: test\n";
        let underlying = serde_yaml::from_str::<serde_json::Value>(bad)
            .unwrap_err()
            .to_string();
        let gitlab = Arc::new(FakeGitLab::new().with_file(".probo.yml", bad));
        let resolver = ConfigResolver::with_default_paths(gitlab);

        let err = resolver.resolve(&session(), "group/app", "abc123").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Failed to parse .probo.yml: {}", underlying)
        );
    }

    #[test]
    fn parse_config_handles_wrapped_base64_and_plain_text() {
        let encoded = STANDARD.encode("a: 1\n");
        let (head, tail) = encoded.split_at(4);
        let wrapped = RepositoryFile {
            file_path: ".probo.yml".into(),
            content: format!("{}\n{}", head, tail),
            encoding: "base64".into(),
        };
        assert_eq!(parse_config(".probo.yml", &wrapped).unwrap(), json!({"a": 1}));

        let plain = RepositoryFile {
            file_path: ".probo.yml".into(),
            content: "a: 2\n".into(),
            encoding: "text".into(),
        };
        assert_eq!(parse_config(".probo.yml", &plain).unwrap(), json!({"a": 2}));
    }

    #[test]
    fn invalid_base64_is_a_parse_error() {
        let file = RepositoryFile {
            file_path: ".probo.yml".into(),
            content: "!!!not base64!!!".into(),
            encoding: "base64".into(),
        };
        let err = parse_config(".probo.yml", &file).unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse .probo.yml: "));
    }
}

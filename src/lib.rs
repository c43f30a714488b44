pub mod alert;
pub mod api;
pub mod build;
pub mod config_resolver;
pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod fakes;
pub mod gitlab;
pub mod logging;
pub mod pipeline;
pub mod status;
pub mod webhook;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::alert::{AlertSink, LogAlertSink, WebhookAlertSink};
use crate::config_resolver::{ConfigResolver, DEFAULT_CONFIG_FILE, DEFAULT_FALLBACK_CONFIG_FILE};
use crate::coordinator::{CoordinatorApi, CoordinatorClient};
use crate::credentials::{CredentialManager, DEFAULT_PROBE_ATTEMPTS};
use crate::error::BridgeError;
use crate::gitlab::{GitLabApi, GitLabClient, OAuthClient};
use crate::pipeline::{DEFAULT_CONFIG_ERROR_CONTEXT, Pipeline, PipelineSettings};
use crate::webhook::Normalizer;

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:3012";
const DEFAULT_WEBHOOK_PATH: &str = "/gitlab-webhook";
const DEFAULT_GITLAB_URL: &str = "https://gitlab.com";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize, Clone)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub gitlab: GitLabConfig,
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            webhook_path: default_webhook_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitLabConfig {
    #[serde(default = "default_gitlab_url")]
    pub base_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    /// Token for lookups that are not tied to a coordinator project.
    pub api_token: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

impl GitLabConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        )
    }

    pub fn oauth_client(&self) -> OAuthClient {
        OAuthClient {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            redirect_uri: self.redirect_uri.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CoordinatorConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BuildConfig {
    /// Primary and fallback config file names, in lookup order.
    #[serde(default = "default_config_files")]
    pub config_files: Vec<String>,
    #[serde(default = "default_build_marker")]
    pub build_marker: String,
    #[serde(default = "default_config_error_context")]
    pub config_error_context: String,
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            config_files: default_config_files(),
            build_marker: default_build_marker(),
            config_error_context: default_config_error_context(),
            probe_attempts: default_probe_attempts(),
        }
    }
}

impl BuildConfig {
    /// Returns the (primary, fallback) config file names.
    pub fn config_paths(&self) -> Result<(&str, &str), BridgeError> {
        match self.config_files.as_slice() {
            [primary, fallback] => Ok((primary.as_str(), fallback.as_str())),
            other => Err(BridgeError::ConfigError(format!(
                "build.config_files needs exactly two entries, got {}",
                other.len()
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AlertConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    pub directory: Option<PathBuf>,
}

fn default_bind_address() -> String {
    DEFAULT_BIND_ADDRESS.to_string()
}

fn default_webhook_path() -> String {
    DEFAULT_WEBHOOK_PATH.to_string()
}

fn default_gitlab_url() -> String {
    DEFAULT_GITLAB_URL.to_string()
}

fn default_config_files() -> Vec<String> {
    vec![
        DEFAULT_CONFIG_FILE.to_string(),
        DEFAULT_FALLBACK_CONFIG_FILE.to_string(),
    ]
}

fn default_build_marker() -> String {
    "[build]".to_string()
}

fn default_config_error_context() -> String {
    DEFAULT_CONFIG_ERROR_CONTEXT.to_string()
}

fn default_probe_attempts() -> usize {
    DEFAULT_PROBE_ATTEMPTS
}

/// Parse and validate a configuration document
pub fn parse_config(content: &str) -> Result<BridgeConfig, BridgeError> {
    let config: BridgeConfig = toml::from_str(content)?;
    config.build.config_paths()?;
    if config.build.probe_attempts == 0 {
        return Err(BridgeError::ConfigError(
            "build.probe_attempts must be at least 1".to_string(),
        ));
    }
    if config.coordinator.url.is_empty() {
        return Err(BridgeError::ConfigError("coordinator.url is empty".to_string()));
    }
    Ok(config)
}

/// Load and parse the configuration file
pub fn load_config(path: impl AsRef<Path>) -> Result<BridgeConfig, BridgeError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        BridgeError::ConfigError(format!("Failed to read config file '{}': {}", path.display(), e))
    })?;
    parse_config(&content).map_err(|e| {
        BridgeError::ConfigError(format!("Failed to parse config file '{}': {}", path.display(), e))
    })
}

pub struct AppState {
    pub config: BridgeConfig,
    pub pipeline: Pipeline,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire the pipeline from explicit collaborators.
    pub fn with_collaborators(
        config: BridgeConfig,
        gitlab: Arc<dyn GitLabApi>,
        coordinator: Arc<dyn CoordinatorApi>,
        alerts: Arc<dyn AlertSink>,
    ) -> Result<Self, BridgeError> {
        let (primary, fallback) = config.build.config_paths()?;
        let resolver = ConfigResolver::new(Arc::clone(&gitlab), primary, fallback);
        let credentials = CredentialManager::new(
            Arc::clone(&gitlab),
            Arc::clone(&coordinator),
            alerts,
            config.gitlab.oauth_client(),
            config.gitlab.base_url.clone(),
        )
        .with_probe_attempts(config.build.probe_attempts);

        let pipeline = Pipeline::new(
            Normalizer::new(config.build.build_marker.clone()),
            gitlab,
            coordinator,
            resolver,
            credentials,
            PipelineSettings {
                default_base_url: config.gitlab.base_url.clone(),
                config_error_context: config.build.config_error_context.clone(),
            },
        );

        Ok(Self {
            config,
            pipeline,
            start_time: Instant::now(),
            started_at: Utc::now(),
        })
    }

    /// Wire the pipeline against the real GitLab and coordinator APIs.
    pub fn from_config(config: BridgeConfig) -> Result<Self, BridgeError> {
        let timeout = config.gitlab.request_timeout();
        let gitlab = GitLabClient::new(timeout)
            .map_err(|e| BridgeError::ConfigError(e.to_string()))?;
        let coordinator = CoordinatorClient::new(config.coordinator.url.clone(), timeout)
            .map_err(|e| BridgeError::ConfigError(e.to_string()))?;
        let alerts: Arc<dyn AlertSink> = match &config.alerts.webhook_url {
            Some(url) => Arc::new(
                WebhookAlertSink::new(url.clone())
                    .map_err(|e| BridgeError::ConfigError(format!("alert webhook client: {}", e)))?,
            ),
            None => Arc::new(LogAlertSink),
        };

        Self::with_collaborators(config, Arc::new(gitlab), Arc::new(coordinator), alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[gitlab]
client_id = "abc"
redirect_uri = "https://bridge.example.com/oauth"

[coordinator]
url = "http://localhost:3010"
"#;

    #[test]
    fn defaults_fill_missing_sections() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:3012");
        assert_eq!(config.server.webhook_path, "/gitlab-webhook");
        assert_eq!(config.gitlab.base_url, "https://gitlab.com");
        assert_eq!(
            config.build.config_paths().unwrap(),
            (".probo.yml", ".probo.yaml")
        );
        assert_eq!(config.build.build_marker, "[build]");
        assert_eq!(config.build.probe_attempts, 5);
        assert!(config.alerts.webhook_url.is_none());
        assert_eq!(config.gitlab.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn config_files_must_be_a_pair() {
        let doc = format!("{}\n[build]\nconfig_files = [\".ci.yml\"]\n", MINIMAL);
        assert!(matches!(
            parse_config(&doc),
            Err(BridgeError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn alert_webhook_is_wired_at_startup() {
        let doc = format!(
            "{}\n[alerts]\nwebhook_url = \"https://hooks.example.com/alerts\"\n",
            MINIMAL
        );
        let state = AppState::from_config(parse_config(&doc).unwrap()).unwrap();
        assert_eq!(
            state.config.alerts.webhook_url.as_deref(),
            Some("https://hooks.example.com/alerts")
        );
    }

    #[test]
    fn zero_probe_attempts_is_rejected() {
        let doc = format!("{}\n[build]\nprobe_attempts = 0\n", MINIMAL);
        assert!(matches!(
            parse_config(&doc),
            Err(BridgeError::ConfigError(_))
        ));
        let doc = format!("{}\n[build]\nprobe_attempts = 1\n", MINIMAL);
        assert_eq!(parse_config(&doc).unwrap().build.probe_attempts, 1);
    }

    #[test]
    fn missing_gitlab_section_is_rejected() {
        let doc = "[coordinator]\nurl = \"http://localhost\"\n";
        assert!(matches!(
            parse_config(doc),
            Err(BridgeError::TomlParseError(_))
        ));
    }
}

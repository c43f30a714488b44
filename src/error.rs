/// Startup errors for the bridge binary
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("TOML parsing error: {0}")]
    TomlParseError(#[from] toml::de::Error),
}

/// Errors returned by the GitLab REST API collaborator
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("GitLab resource not found: {0}")]
    NotFound(String),

    #[error("GitLab API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("GitLab request failed: {0}")]
    Transport(String),

    #[error("Unexpected GitLab response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// The provider's own description of the failure, without our prefix.
    pub fn message(&self) -> &str {
        match self {
            ProviderError::NotFound(m)
            | ProviderError::Transport(m)
            | ProviderError::Decode(m) => m,
            ProviderError::Api { message, .. } => message,
        }
    }
}

/// Errors returned by the build coordinator collaborator
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("No project found for {service} repository '{slug}'")]
    ProjectNotFound { service: String, slug: String },

    #[error("Coordinator API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Coordinator request failed: {0}")]
    Transport(String),
}

/// Build configuration file resolution failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("No config file was found.")]
    NotFound,

    #[error("Failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error(transparent)]
    Upstream(#[from] ProviderError),
}

/// A webhook payload that cannot be turned into a build request
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NormalizeError {
    #[error("Webhook payload is missing field '{0}'")]
    MissingField(&'static str),

    #[error("Webhook payload is malformed: {0}")]
    Malformed(String),
}

/// Commit status submission failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StatusError {
    /// The build system reported a state that has no GitLab equivalent.
    #[error("Unknown status state '{0}'")]
    UnknownState(String),

    #[error("Status dispatch failed: {0}")]
    Dispatch(#[from] ProviderError),

    #[error("Status queue is no longer running")]
    QueueClosed,

    #[error("Status dispatch was aborted before completing")]
    Aborted,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CredentialRefreshError {
    #[error("Project has no refresh token")]
    MissingRefreshToken,

    #[error("Token refresh failed: {0}")]
    Refresh(#[from] ProviderError),

    #[error("Refreshed token could not be stored: {0}")]
    Persist(#[from] CoordinatorError),
}

/// Failures that abort the orchestration of one event
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

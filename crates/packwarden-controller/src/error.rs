//! Error types for packwarden-controller

use thiserror::Error;

/// Result type for controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;

/// Errors raised while reconciling module resources
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// Registry access failed
    #[error("registry error: {0}")]
    Registry(#[from] packwarden_repo::RepoError),

    /// Package definition or values error
    #[error(transparent)]
    Core(#[from] packwarden_core::CoreError),

    /// Object looked up by name does not exist
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    /// Object was changed concurrently
    #[error("{kind} '{name}' was modified concurrently")]
    Conflict { kind: String, name: String },

    /// Object with that name already exists
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: String, name: String },

    /// More than one update policy selects a module
    #[error("more than one update policy matches module '{module}': {policies}")]
    AmbiguousPolicy { module: String, policies: String },

    /// Invalid update window
    #[error("invalid update window: {0}")]
    InvalidWindow(String),

    /// Invalid version in a resource
    #[error("invalid version '{version}': {message}")]
    InvalidVersion { version: String, message: String },

    /// Restart signal could not be delivered
    #[error("restart failed: {0}")]
    Restart(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControllerError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ControllerError::NotFound { .. } => true,
            ControllerError::Api(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            ControllerError::Conflict { .. } => true,
            ControllerError::Api(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ControllerError {
    fn from(e: serde_json::Error) -> Self {
        ControllerError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for ControllerError {
    fn from(e: serde_yaml::Error) -> Self {
        ControllerError::Serialization(e.to_string())
    }
}

impl From<semver::Error> for ControllerError {
    fn from(e: semver::Error) -> Self {
        ControllerError::InvalidVersion {
            version: String::new(),
            message: e.to_string(),
        }
    }
}

//! Error types for registry operations

use thiserror::Error;

/// Registry operation errors
#[derive(Debug, Error)]
pub enum RepoError {
    // ============ Configuration Errors ============
    #[error("Invalid registry repository '{repo}': {reason}")]
    InvalidRepository { repo: String, reason: String },

    #[error("Invalid registry scheme '{scheme}', expected HTTP or HTTPS")]
    InvalidScheme { scheme: String },

    #[error("Invalid docker config: {message}")]
    InvalidDockerConfig { message: String },

    #[error("Invalid CA certificate: {message}")]
    InvalidCa { message: String },

    // ============ OCI Errors ============
    #[error("OCI registry error: {message}")]
    OciError { message: String },

    #[error("Invalid OCI reference: {reference}")]
    InvalidOciReference { reference: String },

    #[error("OCI manifest not found: {reference}")]
    ManifestNotFound { reference: String },

    #[error("Release channel '{channel}' not found for module '{module}'")]
    ReleaseChannelNotFound { module: String, channel: String },

    #[error("Image {reference} has no layers")]
    EmptyImage { reference: String },

    // ============ Release Metadata Errors ============
    #[error("Release image of '{module}' does not contain version.json")]
    MissingVersionFile { module: String },

    #[error("Invalid release metadata: {message}")]
    InvalidMetadata { message: String },

    // ============ IO Errors ============
    #[error(transparent)]
    Core(#[from] packwarden_core::CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RepoError>;

impl RepoError {
    /// Whether the requested image or tag does not exist in the registry
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RepoError::ManifestNotFound { .. } | RepoError::ReleaseChannelNotFound { .. }
        )
    }
}

impl From<serde_yaml::Error> for RepoError {
    fn from(e: serde_yaml::Error) -> Self {
        RepoError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(e: serde_json::Error) -> Self {
        RepoError::Serialization(e.to_string())
    }
}

impl From<semver::Error> for RepoError {
    fn from(e: semver::Error) -> Self {
        RepoError::InvalidMetadata {
            message: format!("Invalid semver: {}", e),
        }
    }
}

impl From<url::ParseError> for RepoError {
    fn from(e: url::ParseError) -> Self {
        RepoError::InvalidRepository {
            repo: String::new(),
            reason: e.to_string(),
        }
    }
}

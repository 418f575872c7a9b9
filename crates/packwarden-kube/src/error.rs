//! Error types for packwarden-kube

use thiserror::Error;

/// Result type for packwarden-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors that can occur while talking to the cluster, Helm or hooks
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// The package has neither `Chart.yaml` nor `templates/`
    #[error("package '{name}' is not a Helm chart")]
    PackageNotHelm { name: String },

    /// A step of a Helm release operation failed
    #[error("helm {step} failed: {message}")]
    Helm { step: HelmStep, message: String },

    /// The helm binary exited with an error
    #[error("helm {0}")]
    HelmCommand(String),

    /// Hook configuration could not be read
    #[error("invalid config of hook '{hook}': {message}")]
    HookConfig { hook: String, message: String },

    /// Hook process failed
    #[error("hook '{hook}' failed: {message}")]
    HookFailed { hook: String, message: String },

    /// Invalid crontab
    #[error("invalid crontab '{crontab}': {message}")]
    InvalidCrontab { crontab: String, message: String },

    /// Monitor is not registered
    #[error("monitor '{0}' not found")]
    MonitorNotFound(String),

    /// Object patch operation rejected or failed
    #[error("object patch failed: {0}")]
    ObjectPatch(String),

    /// Unknown resource type
    #[error("unknown resource type: {api_version}/{kind}")]
    UnknownResource { api_version: String, kind: String },

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Values error
    #[error("values error: {0}")]
    Values(#[from] packwarden_core::CoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation cancelled
    #[error("operation cancelled")]
    Cancelled,
}

/// Steps of a Helm release operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelmStep {
    CheckChart,
    CreateValuesFile,
    MarshalRuntimeValues,
    Render,
    CheckRelease,
    Install,
    Uninstall,
}

impl std::fmt::Display for HelmStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HelmStep::CheckChart => "check chart",
            HelmStep::CreateValuesFile => "create values file",
            HelmStep::MarshalRuntimeValues => "marshal runtime values",
            HelmStep::Render => "render",
            HelmStep::CheckRelease => "check release",
            HelmStep::Install => "install",
            HelmStep::Uninstall => "uninstall",
        };
        write!(f, "{}", s)
    }
}

impl From<serde_json::Error> for KubeError {
    fn from(e: serde_json::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for KubeError {
    fn from(e: serde_yaml::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl KubeError {
    pub(crate) fn helm(step: HelmStep, message: impl std::fmt::Display) -> Self {
        KubeError::Helm {
            step,
            message: message.to_string(),
        }
    }

    /// Check if this is the "not a Helm chart" outcome
    pub fn is_not_helm(&self) -> bool {
        matches!(self, KubeError::PackageNotHelm { .. })
    }

    /// Check if this is a Kubernetes 404 Not Found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, KubeError::Api(kube::Error::Api(resp)) if resp.code == 404)
    }

    /// Check if this is a conflict error (409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, KubeError::Api(kube::Error::Api(resp)) if resp.code == 409)
    }

    /// Check if this is an "already exists" error (409 with reason AlreadyExists)
    pub fn is_already_exists(&self) -> bool {
        matches!(self, KubeError::Api(kube::Error::Api(resp)) if resp.code == 409 && resp.reason == "AlreadyExists")
    }
}

//! Error types for packwarden-runtime

use packwarden_core::CoreError;
use packwarden_kube::{HelmStep, KubeError};
use thiserror::Error;

use crate::status::{Condition, ConditionType};

/// Result type for packwarden-runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur while running packages
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// Cluster, Helm or hook process error
    #[error(transparent)]
    Kube(#[from] KubeError),

    /// Values, schema or definition error
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A lifecycle step of a package failed
    #[error(transparent)]
    Package(#[from] PackageError),

    /// Hook exited with an error
    #[error("hook '{hook}' failed: {message}")]
    HookFailed { hook: String, message: String },

    /// Hook discovery failed
    #[error("invalid hooks of package '{package}': {message}")]
    InvalidHooks { package: String, message: String },

    /// Package is not loaded
    #[error("package '{0}' not found")]
    PackageNotFound(String),

    /// Task or queue was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Debug server error
    #[error("debug server error: {0}")]
    Server(String),

    /// Status could not be written to the cluster
    #[error("status publish failed: {0}")]
    Status(String),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Check if the error comes from a cancelled context
    pub fn is_cancelled(&self) -> bool {
        match self {
            RuntimeError::Cancelled | RuntimeError::Kube(KubeError::Cancelled) => true,
            RuntimeError::Package(e) => e.source.is_cancelled(),
            _ => false,
        }
    }

    /// Check if the package is not a Helm chart
    pub fn is_not_helm(&self) -> bool {
        match self {
            RuntimeError::Kube(e) => e.is_not_helm(),
            RuntimeError::Package(e) => e.source.is_not_helm(),
            _ => false,
        }
    }
}

/// What went wrong in a package lifecycle step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorReason {
    LoadFailed,
    ApplySettings,
    InitHooksFailed,
    StartupHookFailed,
    BeforeHelmHooksFailed,
    AfterHelmHooksFailed,
    AfterDeleteHelmHooksFailed,
    RenderFailed,
    CheckChart,
    CreateValuesFile,
    MarshalRuntimeValues,
    CheckRelease,
    InstallChart,
    UninstallFailed,
}

impl ErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorReason::LoadFailed => "LoadFailed",
            ErrorReason::ApplySettings => "ApplySettings",
            ErrorReason::InitHooksFailed => "InitHooksFailed",
            ErrorReason::StartupHookFailed => "StartupHookFailed",
            ErrorReason::BeforeHelmHooksFailed => "BeforeHelmHooksFailed",
            ErrorReason::AfterHelmHooksFailed => "AfterHelmHooksFailed",
            ErrorReason::AfterDeleteHelmHooksFailed => "AfterDeleteHelmHooksFailed",
            ErrorReason::RenderFailed => "RenderFailed",
            ErrorReason::CheckChart => "CheckChart",
            ErrorReason::CreateValuesFile => "CreateValuesFile",
            ErrorReason::MarshalRuntimeValues => "MarshalRuntimeValues",
            ErrorReason::CheckRelease => "CheckRelease",
            ErrorReason::InstallChart => "InstallChart",
            ErrorReason::UninstallFailed => "UninstallFailed",
        }
    }

    /// Conditions reported on the package for this failure
    pub fn conditions(&self, message: &str) -> Vec<Condition> {
        let reason = self.as_str();
        match self {
            ErrorReason::LoadFailed => {
                vec![Condition::failed(ConditionType::ReadyInRuntime, reason, message)]
            }
            ErrorReason::ApplySettings => vec![
                Condition::failed(ConditionType::SettingsValid, reason, message),
                Condition::failed(ConditionType::ReadyInRuntime, reason, message),
            ],
            ErrorReason::InitHooksFailed => vec![
                Condition::failed(ConditionType::HooksProcessed, reason, message),
                Condition::failed(ConditionType::ReadyInRuntime, reason, message),
            ],
            ErrorReason::StartupHookFailed
            | ErrorReason::BeforeHelmHooksFailed
            | ErrorReason::AfterHelmHooksFailed
            | ErrorReason::AfterDeleteHelmHooksFailed => vec![
                Condition::failed(ConditionType::HooksProcessed, reason, message),
                Condition::failed(ConditionType::ReadyInRuntime, "HooksFailed", message),
            ],
            ErrorReason::InstallChart => vec![
                Condition::failed(ConditionType::HelmApplied, reason, message),
                Condition::failed(ConditionType::ReadyInRuntime, "HelmUpgradeFailed", message),
                Condition::failed(ConditionType::ReadyInCluster, "HelmUpgradeFailed", message),
            ],
            ErrorReason::RenderFailed
            | ErrorReason::CheckChart
            | ErrorReason::CreateValuesFile
            | ErrorReason::MarshalRuntimeValues
            | ErrorReason::CheckRelease
            | ErrorReason::UninstallFailed => {
                vec![Condition::failed(ConditionType::HelmApplied, reason, message)]
            }
        }
    }
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<HelmStep> for ErrorReason {
    fn from(step: HelmStep) -> Self {
        match step {
            HelmStep::CheckChart => ErrorReason::CheckChart,
            HelmStep::CreateValuesFile => ErrorReason::CreateValuesFile,
            HelmStep::MarshalRuntimeValues => ErrorReason::MarshalRuntimeValues,
            HelmStep::Render => ErrorReason::RenderFailed,
            HelmStep::CheckRelease => ErrorReason::CheckRelease,
            HelmStep::Install => ErrorReason::InstallChart,
            HelmStep::Uninstall => ErrorReason::UninstallFailed,
        }
    }
}

/// A failed lifecycle step together with the conditions to report
#[derive(Debug, Error)]
#[error("{reason}: {source}")]
pub struct PackageError {
    pub reason: ErrorReason,
    pub conditions: Vec<Condition>,
    #[source]
    pub source: Box<RuntimeError>,
}

impl PackageError {
    pub fn new(reason: ErrorReason, source: impl Into<RuntimeError>) -> Self {
        let source = source.into();
        let conditions = reason.conditions(&source.to_string());
        Self {
            reason,
            conditions,
            source: Box::new(source),
        }
    }

    /// Classify a Helm failure by its step
    pub fn helm(error: KubeError) -> Self {
        let reason = match &error {
            KubeError::Helm { step, .. } => ErrorReason::from(*step),
            _ => ErrorReason::InstallChart,
        };
        Self::new(reason, error)
    }
}

//! CLI error types with exit code handling

use miette::Diagnostic;
use thiserror::Error;

use crate::exit_codes;

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    /// Invalid flags, environment or derived settings
    #[error("Configuration error: {message}")]
    #[diagnostic(code(packwarden::cli::config))]
    Config {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// Cluster or debug socket unreachable
    #[error("Unavailable: {message}")]
    #[diagnostic(code(packwarden::cli::unavailable))]
    Unavailable {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// The debug server answered with an error status
    #[error("Request failed with status {status}: {message}")]
    #[diagnostic(code(packwarden::cli::request))]
    Request { status: u16, message: String },

    /// Operator or controller failure
    #[error("Operator error: {message}")]
    #[diagnostic(code(packwarden::cli::operator))]
    Operator { message: String },

    #[error("IO error: {message}")]
    #[diagnostic(code(packwarden::cli::io))]
    Io { message: String },
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config { .. } => exit_codes::CONFIG_ERROR,
            CliError::Unavailable { .. } => exit_codes::UNAVAILABLE,
            CliError::Request { status, .. } if *status == 400 => exit_codes::USAGE_ERROR,
            CliError::Request { .. } | CliError::Operator { .. } | CliError::Io { .. } => {
                exit_codes::ERROR
            }
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: None,
        }
    }

    pub fn unavailable_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    pub fn operator(message: impl Into<String>) -> Self {
        Self::Operator {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Io {
            message: err.to_string(),
        }
    }
}

impl From<packwarden_runtime::RuntimeError> for CliError {
    fn from(err: packwarden_runtime::RuntimeError) -> Self {
        CliError::operator(err.to_string())
    }
}

impl From<packwarden_controller::ControllerError> for CliError {
    fn from(err: packwarden_controller::ControllerError) -> Self {
        CliError::operator(err.to_string())
    }
}

impl From<packwarden_kube::KubeError> for CliError {
    fn from(err: packwarden_kube::KubeError) -> Self {
        CliError::Unavailable {
            message: err.to_string(),
            help: None,
        }
    }
}

impl From<kube::Error> for CliError {
    fn from(err: kube::Error) -> Self {
        CliError::Unavailable {
            message: err.to_string(),
            help: Some("check the in-cluster service account or KUBECONFIG".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::config("bad").exit_code(), exit_codes::CONFIG_ERROR);
        assert_eq!(
            CliError::unavailable_with_help("no socket", "is it running?").exit_code(),
            exit_codes::UNAVAILABLE
        );
        let not_helm = CliError::Request {
            status: 400,
            message: "not a chart".to_string(),
        };
        assert_eq!(not_helm.exit_code(), exit_codes::USAGE_ERROR);
        let failed = CliError::Request {
            status: 500,
            message: "render failed".to_string(),
        };
        assert_eq!(failed.exit_code(), exit_codes::ERROR);
    }
}

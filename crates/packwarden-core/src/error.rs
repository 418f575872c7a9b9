//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Package definition not found in {path}")]
    DefinitionNotFound { path: String },

    #[error("Invalid package definition: {message}")]
    InvalidDefinition { message: String },

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid version: {0}")]
    InvalidVersion(#[from] semver::Error),

    #[error("Invalid version constraint '{constraint}': {message}")]
    InvalidConstraint { constraint: String, message: String },

    #[error("Invalid schema: {message}")]
    InvalidSchema { message: String },

    #[error("Config schema is not defined for '{name}'")]
    SchemaNotDefined { name: String },

    #[error("Validation failed:\n{}", format_validation_errors(.errors))]
    Validation { errors: Vec<ValidationErrorInfo> },

    #[error("Invalid patch: {message}")]
    InvalidPatch { message: String },

    #[error("Patch path not found: {path}")]
    PatchPathNotFound { path: String },

    #[error("Unsafe archive entry: {path}")]
    UnsafeArchiveEntry { path: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },
}

/// A single schema violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrorInfo {
    /// JSON pointer to the invalid value ("(root)" for the document itself)
    pub path: String,
    pub message: String,
}

fn format_validation_errors(errors: &[ValidationErrorInfo]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}: {}", e.path, e.message))
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Result<T> = std::result::Result<T, CoreError>;

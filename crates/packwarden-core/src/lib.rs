//! Packwarden Core - Core types for the package lifecycle operator
//!
//! This crate provides the foundational types used throughout Packwarden:
//! - `Definition`: The static package description (`package.yaml`)
//! - `Values`: Values documents with deep merge and stable checksums
//! - `ValuesPatch`: JSON patches produced by hooks
//! - `OpenApiSchema`: Config/values schema validation and defaults
//! - `ValuesStorage`: Layered, patchable values of one package
//! - `Constraint`: Version range constraints
//! - `archive`: Safe extraction of package image layers

pub mod archive;
pub mod definition;
pub mod error;
pub mod patch;
pub mod schema;
pub mod storage;
pub mod values;
pub mod version;

pub use definition::{Definition, Dependency, DisableOptions, Requirements, load_digests};
pub use error::{CoreError, Result, ValidationErrorInfo};
pub use patch::{PatchMode, PatchOp, PatchOperation, ValuesPatch};
pub use schema::{OpenApiSchema, inject_registry_property};
pub use storage::ValuesStorage;
pub use values::{Values, checksum_json};
pub use version::{Constraint, parse_version};

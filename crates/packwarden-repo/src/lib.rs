//! Packwarden Registry Access
//!
//! Module images are distributed through an OCI registry:
//!
//! - `<repo>` lists the published module names as tags
//! - `<repo>/<module>` holds one image per released version (`v1.2.3`)
//! - `<repo>/<module>/release` holds one metadata image per release channel
//!
//! [`ModuleDownloader`] maps those images onto the on-disk layout the
//! controllers link modules from. [`RegistryClient`] is the seam between
//! the downloader and the network; [`MockRegistryClient`] replaces it in tests.

pub mod credentials;
pub mod downloader;
pub mod error;
pub mod mock;
pub mod oci;

pub use credentials::{DockerConfig, RegistryConfig, Scheme};
pub use downloader::{DownloadedModule, ModuleDownloader, ReleaseMetadata, kebab_case};
pub use error::{RepoError, Result};
pub use mock::MockRegistryClient;
pub use oci::{Image, OciRegistryClient, RegistryClient};

//! Module image download layout
//!
//! ```text
//! <downloaded>/<module>/v<version>/   released module trees
//! <downloaded>/<module>/dev/          pull override trees
//! ```
//!
//! Release metadata lives in `<repo>/<module>/release:<kebab-channel>`.

use md5::{Digest, Md5};
use packwarden_core::{Definition, archive};
use semver::Version;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::credentials::RegistryConfig;
use crate::error::{RepoError, Result};
use crate::oci::{Image, RegistryClient};

/// Tag of the root repository that is not a module
const MODULES_TAG: &str = "modules";

/// Directory name of pull override downloads
pub const DEV_DIR: &str = "dev";

const VERSION_FILE: &str = "version.json";
const CHANGELOG_FILE: &str = "changelog.yaml";
const DEFINITION_FILE: &str = "module.yaml";

/// Contents of a release metadata image
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseMetadata {
    pub version: Version,
    pub changelog: serde_json::Value,
    pub definition: Option<Definition>,
    /// md5 hex over the metadata files
    pub checksum: String,
}

#[derive(Debug, Deserialize)]
struct VersionFile {
    version: String,
    #[serde(default)]
    changelog: Option<serde_json::Value>,
}

/// A module tree extracted to disk
#[derive(Debug, Clone)]
pub struct DownloadedModule {
    pub path: PathBuf,
    pub digest: Option<String>,
    pub size: u64,
    pub pull_duration: Duration,
}

/// `EarlyAccess` → `early-access`
pub fn kebab_case(channel: &str) -> String {
    let mut out = String::with_capacity(channel.len() + 4);
    for (i, c) in channel.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 && !out.ends_with('-') {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else if c == '_' || c == ' ' {
            out.push('-');
        } else {
            out.push(c);
        }
    }
    out
}

/// Downloads module images and release metadata of one registry
pub struct ModuleDownloader {
    client: Arc<dyn RegistryClient>,
    registry: RegistryConfig,
    downloaded_dir: PathBuf,
}

impl ModuleDownloader {
    pub fn new(
        client: Arc<dyn RegistryClient>,
        registry: RegistryConfig,
        downloaded_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            registry,
            downloaded_dir: downloaded_dir.into(),
        }
    }

    pub fn registry(&self) -> &RegistryConfig {
        &self.registry
    }

    pub fn downloaded_dir(&self) -> &Path {
        &self.downloaded_dir
    }

    /// `<downloaded>/<module>/v<version>`
    pub fn version_dir(&self, module: &str, version: &Version) -> PathBuf {
        self.downloaded_dir
            .join(module)
            .join(format!("v{}", version))
    }

    /// `<downloaded>/<module>/dev`
    pub fn dev_dir(&self, module: &str) -> PathBuf {
        self.downloaded_dir.join(module).join(DEV_DIR)
    }

    /// Module names published in the registry, sorted
    pub async fn list_modules(&self) -> Result<Vec<String>> {
        let mut tags = self
            .client
            .list_tags(&self.registry, &self.registry.repository(""))
            .await?;
        tags.retain(|t| t != MODULES_TAG);
        tags.sort();
        tags.dedup();
        Ok(tags)
    }

    /// Tags of a module image
    pub async fn list_module_tags(&self, module: &str) -> Result<Vec<String>> {
        self.client
            .list_tags(&self.registry, &self.registry.repository(module))
            .await
    }

    /// Read `version.json`, `changelog.yaml` and `module.yaml` of a channel
    pub async fn fetch_release_metadata(
        &self,
        module: &str,
        channel: &str,
    ) -> Result<ReleaseMetadata> {
        let repository = self.registry.repository(&format!("{}/release", module));
        let tag = kebab_case(channel);

        let image = match self.client.pull_image(&self.registry, &repository, &tag).await {
            Ok(image) => image,
            Err(e) if e.is_not_found() => {
                return Err(RepoError::ReleaseChannelNotFound {
                    module: module.to_string(),
                    channel: tag,
                });
            }
            Err(e) => return Err(e),
        };

        parse_release_image(module, &image)
    }

    /// Download a released version into its versioned directory
    pub async fn download_version(
        &self,
        module: &str,
        version: &Version,
    ) -> Result<DownloadedModule> {
        let tag = format!("v{}", version);
        let dest = self.version_dir(module, version);
        self.download(module, &tag, dest).await
    }

    /// Download an arbitrary tag into the module's dev directory
    pub async fn download_dev(&self, module: &str, tag: &str) -> Result<DownloadedModule> {
        let dest = self.dev_dir(module);
        self.download(module, tag, dest).await
    }

    /// Digest of a module image tag without pulling layers
    pub async fn image_digest(&self, module: &str, tag: &str) -> Result<String> {
        self.client
            .image_digest(&self.registry, &self.registry.repository(module), tag)
            .await
    }

    async fn download(&self, module: &str, tag: &str, dest: PathBuf) -> Result<DownloadedModule> {
        let started = Instant::now();
        let repository = self.registry.repository(module);
        let image = self.client.pull_image(&self.registry, &repository, tag).await?;
        let pull_duration = started.elapsed();

        if dest.exists() {
            std::fs::remove_dir_all(&dest)?;
        }
        let mut files = 0;
        for layer in &image.layers {
            files += archive::extract_layer(layer, &dest)?;
        }

        tracing::info!(
            module = %module,
            tag = %tag,
            files,
            path = %dest.display(),
            "module image downloaded"
        );

        Ok(DownloadedModule {
            path: dest,
            digest: image.digest.clone(),
            size: image.size(),
            pull_duration,
        })
    }
}

fn parse_release_image(module: &str, image: &Image) -> Result<ReleaseMetadata> {
    let mut files = BTreeMap::new();
    for layer in &image.layers {
        files.extend(archive::read_layer_files(layer)?);
    }

    let version_raw = files
        .get(VERSION_FILE)
        .ok_or_else(|| RepoError::MissingVersionFile {
            module: module.to_string(),
        })?;
    let version_file: VersionFile = serde_json::from_slice(version_raw)?;
    let version = Version::parse(version_file.version.trim_start_matches('v'))?;

    let mut hasher = Md5::new();
    hasher.update(version_raw);

    let changelog = match files.get(CHANGELOG_FILE) {
        Some(raw) => {
            hasher.update(raw);
            serde_yaml::from_slice(raw)?
        }
        None => version_file.changelog.unwrap_or(serde_json::Value::Null),
    };

    let definition = match files.get(DEFINITION_FILE) {
        Some(raw) => {
            hasher.update(raw);
            let text = String::from_utf8_lossy(raw);
            Some(Definition::from_yaml(&text)?)
        }
        None => None,
    };

    Ok(ReleaseMetadata {
        version,
        changelog,
        definition,
        checksum: hex::encode(hasher.finalize()),
    })
}

//! In-memory registry for tests

use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::credentials::RegistryConfig;
use crate::error::{RepoError, Result};
use crate::oci::{Image, RegistryClient};

/// Registry holding images by `repository:tag`
///
/// Repositories are relative to the registry host, as in [`RegistryClient`].
#[derive(Default)]
pub struct MockRegistryClient {
    images: RwLock<HashMap<String, Image>>,
    tags: RwLock<BTreeMap<String, Vec<String>>>,
    failure: RwLock<Option<String>>,
    pull_count: AtomicUsize,
    list_count: AtomicUsize,
}

impl MockRegistryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an image made of a single layer with the given files
    pub fn add_image(&self, repository: &str, tag: &str, files: &[(&str, &[u8])]) -> Result<String> {
        let layer = packwarden_core::archive::build_layer(files)?;
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&layer)));

        self.images.write().insert(
            key(repository, tag),
            Image {
                digest: Some(digest.clone()),
                layers: vec![layer],
            },
        );
        self.add_tag(repository, tag);
        Ok(digest)
    }

    /// Make a tag visible without an image behind it
    pub fn add_tag(&self, repository: &str, tag: &str) {
        let mut tags = self.tags.write();
        let list = tags.entry(repository.to_string()).or_default();
        if !list.iter().any(|t| t == tag) {
            list.push(tag.to_string());
        }
    }

    pub fn remove_image(&self, repository: &str, tag: &str) {
        self.images.write().remove(&key(repository, tag));
        if let Some(list) = self.tags.write().get_mut(repository) {
            list.retain(|t| t != tag);
        }
    }

    /// Fail every call with the given message until cleared
    pub fn set_failure(&self, message: Option<&str>) {
        *self.failure.write() = message.map(str::to_string);
    }

    pub fn pull_count(&self) -> usize {
        self.pull_count.load(Ordering::SeqCst)
    }

    pub fn list_count(&self) -> usize {
        self.list_count.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> Result<()> {
        match self.failure.read().as_ref() {
            Some(message) => Err(RepoError::OciError {
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    fn image(&self, repository: &str, tag: &str) -> Result<Image> {
        self.images
            .read()
            .get(&key(repository, tag))
            .cloned()
            .ok_or_else(|| RepoError::ManifestNotFound {
                reference: key(repository, tag),
            })
    }
}

fn key(repository: &str, tag: &str) -> String {
    format!("{}:{}", repository, tag)
}

#[async_trait]
impl RegistryClient for MockRegistryClient {
    async fn list_tags(&self, _registry: &RegistryConfig, repository: &str) -> Result<Vec<String>> {
        self.list_count.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        self.tags
            .read()
            .get(repository)
            .cloned()
            .ok_or_else(|| RepoError::ManifestNotFound {
                reference: repository.to_string(),
            })
    }

    async fn pull_image(
        &self,
        _registry: &RegistryConfig,
        repository: &str,
        tag: &str,
    ) -> Result<Image> {
        self.pull_count.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        self.image(repository, tag)
    }

    async fn image_digest(
        &self,
        _registry: &RegistryConfig,
        repository: &str,
        tag: &str,
    ) -> Result<String> {
        self.check_failure()?;
        let image = self.image(repository, tag)?;
        image.digest.ok_or_else(|| RepoError::OciError {
            message: "image without digest".to_string(),
        })
    }
}

//! OCI registry client
//!
//! Module images are plain container images whose layers hold the module
//! tree. The client only reads: tag listing, image pull and manifest digest.

use async_trait::async_trait;
use oci_distribution::Reference;
use oci_distribution::client::{
    Certificate, CertificateEncoding, Client, ClientConfig, ClientProtocol,
};
use oci_distribution::manifest::{
    IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE, IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
    IMAGE_LAYER_GZIP_MEDIA_TYPE, IMAGE_LAYER_MEDIA_TYPE,
};

use crate::credentials::{RegistryConfig, Scheme};
use crate::error::{RepoError, Result};

/// Layer media types accepted when pulling module images
pub const LAYER_MEDIA_TYPES: [&str; 4] = [
    IMAGE_LAYER_MEDIA_TYPE,
    IMAGE_LAYER_GZIP_MEDIA_TYPE,
    IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
    IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
];

/// A pulled image: manifest digest and raw layer blobs in manifest order
#[derive(Debug, Clone, Default)]
pub struct Image {
    pub digest: Option<String>,
    pub layers: Vec<Vec<u8>>,
}

impl Image {
    /// Total size of all layers in bytes
    pub fn size(&self) -> u64 {
        self.layers.iter().map(|l| l.len() as u64).sum()
    }
}

/// Read access to an OCI registry
///
/// `repository` is always relative to the registry host, e.g.
/// `deckhouse/modules/echo`.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn list_tags(&self, registry: &RegistryConfig, repository: &str) -> Result<Vec<String>>;

    async fn pull_image(
        &self,
        registry: &RegistryConfig,
        repository: &str,
        tag: &str,
    ) -> Result<Image>;

    async fn image_digest(
        &self,
        registry: &RegistryConfig,
        repository: &str,
        tag: &str,
    ) -> Result<String>;
}

/// [`RegistryClient`] backed by `oci-distribution`
#[derive(Debug, Default, Clone, Copy)]
pub struct OciRegistryClient;

impl OciRegistryClient {
    pub fn new() -> Self {
        Self
    }

    fn create_client(registry: &RegistryConfig) -> Result<Client> {
        let protocol = match registry.scheme {
            Scheme::Http => ClientProtocol::Http,
            Scheme::Https => ClientProtocol::Https,
        };

        let mut extra_root_certificates = Vec::new();
        if let Some(ca) = registry.ca.as_deref().filter(|ca| !ca.trim().is_empty()) {
            if !ca.contains("-----BEGIN CERTIFICATE-----") {
                return Err(RepoError::InvalidCa {
                    message: "expected a PEM encoded certificate".to_string(),
                });
            }
            extra_root_certificates.push(Certificate {
                encoding: CertificateEncoding::Pem,
                data: ca.as_bytes().to_vec(),
            });
        }

        let config = ClientConfig {
            protocol,
            extra_root_certificates,
            ..Default::default()
        };
        Ok(Client::new(config))
    }

    fn reference(registry: &RegistryConfig, repository: &str, tag: &str) -> Result<Reference> {
        let host = registry.host()?;
        if repository.is_empty() || tag.is_empty() {
            return Err(RepoError::InvalidOciReference {
                reference: format!("{}/{}:{}", host, repository, tag),
            });
        }
        Ok(Reference::with_tag(
            host.to_string(),
            repository.to_string(),
            tag.to_string(),
        ))
    }
}

/// Map a client error, recognizing missing manifests and repositories
fn map_error(reference: &Reference, e: impl std::fmt::Display) -> RepoError {
    let message = e.to_string();
    let lower = message.to_lowercase();
    if lower.contains("manifest unknown")
        || lower.contains("name unknown")
        || lower.contains("not found")
        || lower.contains("404")
    {
        RepoError::ManifestNotFound {
            reference: reference.whole(),
        }
    } else {
        RepoError::OciError { message }
    }
}

#[async_trait]
impl RegistryClient for OciRegistryClient {
    async fn list_tags(&self, registry: &RegistryConfig, repository: &str) -> Result<Vec<String>> {
        let client = Self::create_client(registry)?;
        let reference = Self::reference(registry, repository, "latest")?;
        let auth = registry.auth()?;

        tracing::debug!(repository = %repository, "listing registry tags");
        let response = client
            .list_tags(&reference, &auth, None, None)
            .await
            .map_err(|e| map_error(&reference, e))?;
        Ok(response.tags)
    }

    async fn pull_image(
        &self,
        registry: &RegistryConfig,
        repository: &str,
        tag: &str,
    ) -> Result<Image> {
        let client = Self::create_client(registry)?;
        let reference = Self::reference(registry, repository, tag)?;
        let auth = registry.auth()?;

        tracing::debug!(image = %reference.whole(), "pulling image");
        let data = client
            .pull(&reference, &auth, LAYER_MEDIA_TYPES.to_vec())
            .await
            .map_err(|e| map_error(&reference, e))?;

        if data.layers.is_empty() {
            return Err(RepoError::EmptyImage {
                reference: reference.whole(),
            });
        }

        Ok(Image {
            digest: data.digest,
            layers: data.layers.into_iter().map(|l| l.data).collect(),
        })
    }

    async fn image_digest(
        &self,
        registry: &RegistryConfig,
        repository: &str,
        tag: &str,
    ) -> Result<String> {
        let client = Self::create_client(registry)?;
        let reference = Self::reference(registry, repository, tag)?;
        let auth = registry.auth()?;

        client
            .fetch_manifest_digest(&reference, &auth)
            .await
            .map_err(|e| map_error(&reference, e))
    }
}

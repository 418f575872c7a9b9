//! Registry connection settings and docker config credentials
//!
//! A module source carries its registry as a repo path, a scheme, an
//! optional CA and an optional base64-encoded docker config. The docker
//! config is resolved into [`RegistryAuth`] for the registry host.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use md5::{Digest, Md5};
use oci_distribution::secrets::RegistryAuth;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::{RepoError, Result};

/// Transport used to reach the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scheme {
    Http,
    #[default]
    Https,
}

impl FromStr for Scheme {
    type Err = RepoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "https" | "" => Ok(Scheme::Https),
            _ => Err(RepoError::InvalidScheme {
                scheme: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => write!(f, "HTTP"),
            Scheme::Https => write!(f, "HTTPS"),
        }
    }
}

/// Where module images live and how to authenticate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// `host[:port]/path`, e.g. `registry.example.com/deckhouse/modules`
    pub repo: String,
    #[serde(default)]
    pub scheme: Scheme,
    /// Base64-encoded docker `config.json`
    #[serde(default, rename = "dockerCfg", skip_serializing_if = "Option::is_none")]
    pub docker_cfg: Option<String>,
    /// PEM-encoded CA certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
}

impl RegistryConfig {
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            ..Default::default()
        }
    }

    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_docker_cfg(mut self, docker_cfg: impl Into<String>) -> Self {
        self.docker_cfg = Some(docker_cfg.into());
        self
    }

    pub fn with_ca(mut self, ca: impl Into<String>) -> Self {
        self.ca = Some(ca.into());
        self
    }

    fn trimmed(&self) -> &str {
        self.repo
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
    }

    /// Registry host with port, the first segment of the repo
    pub fn host(&self) -> Result<&str> {
        let repo = self.trimmed();
        let host = repo.split('/').next().unwrap_or_default();
        if host.is_empty() {
            return Err(RepoError::InvalidRepository {
                repo: self.repo.clone(),
                reason: "missing registry host".to_string(),
            });
        }
        Ok(host)
    }

    /// Repository path below the host, possibly empty
    pub fn path(&self) -> &str {
        let repo = self.trimmed();
        repo.split_once('/').map(|(_, path)| path).unwrap_or_default()
    }

    /// Join a sub-path onto the repository path
    pub fn repository(&self, sub: &str) -> String {
        match (self.path(), sub) {
            ("", sub) => sub.to_string(),
            (path, "") => path.to_string(),
            (path, sub) => format!("{}/{}", path, sub),
        }
    }

    /// Credentials for the registry host, anonymous when none match
    pub fn auth(&self) -> Result<RegistryAuth> {
        let Some(encoded) = self.docker_cfg.as_deref().filter(|c| !c.is_empty()) else {
            return Ok(RegistryAuth::Anonymous);
        };
        let config = DockerConfig::from_base64(encoded)?;
        Ok(config.auth_for_host(self.host()?))
    }

    /// md5 of repo and docker config, recorded on the source to detect changes
    pub fn checksum(&self) -> String {
        let mut hasher = Md5::new();
        hasher.update(self.repo.as_bytes());
        if let Some(cfg) = &self.docker_cfg {
            hasher.update(cfg.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Docker config.json format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: HashMap<String, DockerAuth>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerAuth {
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl DockerConfig {
    /// Decode a base64-encoded config.json
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| RepoError::InvalidDockerConfig {
                message: format!("base64: {}", e),
            })?;
        serde_json::from_slice(&raw).map_err(|e| RepoError::InvalidDockerConfig {
            message: e.to_string(),
        })
    }

    /// Resolve credentials for a registry host
    ///
    /// Keys may be bare hosts or URLs; both forms are matched.
    pub fn auth_for_host(&self, host: &str) -> RegistryAuth {
        let entry = self.auths.iter().find_map(|(key, auth)| {
            let key_host = match Url::parse(key) {
                Ok(url) if url.has_host() => match (url.host_str(), url.port()) {
                    (Some(h), Some(p)) => format!("{}:{}", h, p),
                    (Some(h), None) => h.to_string(),
                    _ => key.clone(),
                },
                _ => key.trim_end_matches('/').to_string(),
            };
            (key_host == host).then_some(auth)
        });

        match entry.and_then(DockerAuth::credentials) {
            Some((user, pass)) => RegistryAuth::Basic(user, pass),
            None => RegistryAuth::Anonymous,
        }
    }
}

impl DockerAuth {
    fn credentials(&self) -> Option<(String, String)> {
        if let (Some(u), Some(p)) = (&self.username, &self.password) {
            return Some((u.clone(), p.clone()));
        }
        let decoded = STANDARD.decode(self.auth.as_deref()?).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        Some((user.to_string(), pass.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docker_cfg(json: &str) -> String {
        STANDARD.encode(json)
    }

    #[test]
    fn test_host_and_path() {
        let cfg = RegistryConfig::new("registry.example.com:5000/deckhouse/modules/");
        assert_eq!(cfg.host().unwrap(), "registry.example.com:5000");
        assert_eq!(cfg.path(), "deckhouse/modules");
        assert_eq!(cfg.repository("echo/release"), "deckhouse/modules/echo/release");
        assert_eq!(cfg.repository(""), "deckhouse/modules");
    }

    #[test]
    fn test_scheme_parse() {
        assert_eq!("HTTP".parse::<Scheme>().unwrap(), Scheme::Http);
        assert_eq!("https".parse::<Scheme>().unwrap(), Scheme::Https);
        assert!("ftp".parse::<Scheme>().is_err());
    }

    #[test]
    fn test_auth_from_encoded_pair() {
        let pair = STANDARD.encode("user:secret");
        let cfg = RegistryConfig::new("registry.example.com/modules").with_docker_cfg(
            docker_cfg(&format!(r#"{{"auths":{{"registry.example.com":{{"auth":"{}"}}}}}}"#, pair)),
        );
        match cfg.auth().unwrap() {
            RegistryAuth::Basic(user, pass) => {
                assert_eq!(user, "user");
                assert_eq!(pass, "secret");
            }
            _ => panic!("expected basic auth"),
        }
    }

    #[test]
    fn test_auth_matches_url_keys() {
        let cfg = RegistryConfig::new("registry.example.com/modules").with_docker_cfg(docker_cfg(
            r#"{"auths":{"https://registry.example.com":{"username":"u","password":"p"}}}"#,
        ));
        assert!(matches!(cfg.auth().unwrap(), RegistryAuth::Basic(u, _) if u == "u"));
    }

    #[test]
    fn test_auth_anonymous_without_match() {
        let cfg = RegistryConfig::new("other.example.com/modules").with_docker_cfg(docker_cfg(
            r#"{"auths":{"registry.example.com":{"username":"u","password":"p"}}}"#,
        ));
        assert!(matches!(cfg.auth().unwrap(), RegistryAuth::Anonymous));
        assert!(matches!(
            RegistryConfig::new("r.example.com/m").auth().unwrap(),
            RegistryAuth::Anonymous
        ));
    }

    #[test]
    fn test_invalid_docker_cfg() {
        let cfg = RegistryConfig::new("r.example.com/m").with_docker_cfg("%%%");
        assert!(matches!(cfg.auth(), Err(RepoError::InvalidDockerConfig { .. })));
    }

    #[test]
    fn test_checksum_changes_with_credentials() {
        let a = RegistryConfig::new("r.example.com/m");
        let b = a.clone().with_docker_cfg("e30=");
        assert_eq!(a.checksum().len(), 32);
        assert_ne!(a.checksum(), b.checksum());
        assert_eq!(a.checksum(), RegistryConfig::new("r.example.com/m").checksum());
    }
}

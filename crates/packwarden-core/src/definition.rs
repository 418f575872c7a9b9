//! Package definition (`package.yaml` / `module.yaml`)

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{CoreError, Result};
use crate::version::{Constraint, parse_version};

/// Weight used when a package does not declare one
pub const DEFAULT_WEIGHT: u32 = 900;

/// Definition file names, in lookup order
pub const DEFINITION_FILES: [&str; 2] = ["package.yaml", "module.yaml"];

/// Image digests shipped with a package
pub const DIGESTS_FILE: &str = "images_digests.json";

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid regex"));

/// Static description of a package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Definition {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Namespace the Helm release is installed into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default)]
    pub requirements: Requirements,

    #[serde(default, alias = "disable")]
    pub disable_options: DisableOptions,
}

fn default_weight() -> u32 {
    DEFAULT_WEIGHT
}

/// Requirements a package puts on its environment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requirements {
    /// Cluster (Kubernetes) version constraint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<Constraint>,

    /// Platform version constraint
    #[serde(default, alias = "platform", skip_serializing_if = "Option::is_none")]
    pub deckhouse: Option<Constraint>,

    /// Other packages this one depends on
    #[serde(default, alias = "dependencies", skip_serializing_if = "BTreeMap::is_empty")]
    pub modules: BTreeMap<String, Dependency>,
}

/// A dependency on another package
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dependency {
    pub constraint: Constraint,
    pub optional: bool,
}

impl<'de> Deserialize<'de> for Dependency {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Short(String),
            Full {
                constraint: String,
                #[serde(default)]
                optional: bool,
            },
        }

        let (text, optional) = match Raw::deserialize(deserializer)? {
            Raw::Short(text) => match text.trim().strip_suffix("!optional") {
                Some(rest) => (rest.trim().to_string(), true),
                None => (text, false),
            },
            Raw::Full {
                constraint,
                optional,
            } => (constraint, optional),
        };

        let constraint = Constraint::parse(&text).map_err(serde::de::Error::custom)?;
        Ok(Dependency {
            constraint,
            optional,
        })
    }
}

/// Confirmation required before a package may be disabled
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisableOptions {
    #[serde(default)]
    pub confirmation: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Definition {
    /// A minimal definition for a package without a definition file
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            weight: DEFAULT_WEIGHT,
            stage: None,
            description: None,
            namespace: None,
            requirements: Requirements::default(),
            disable_options: DisableOptions::default(),
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let definition: Definition =
            serde_yaml::from_str(yaml).map_err(|e| CoreError::InvalidDefinition {
                message: e.to_string(),
            })?;
        definition.validate()?;
        Ok(definition)
    }

    /// Read the definition file of a package directory, if there is one
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        for file in DEFINITION_FILES {
            let path = dir.join(file);
            if path.is_file() {
                let content = std::fs::read_to_string(&path)?;
                return Self::from_yaml(&content).map(Some);
            }
        }
        Ok(None)
    }

    /// Like [`Definition::load`], failing when the file is missing
    pub fn load_required(dir: &Path) -> Result<Self> {
        Self::load(dir)?.ok_or_else(|| CoreError::DefinitionNotFound {
            path: dir.display().to_string(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !NAME_RE.is_match(&self.name) {
            return Err(CoreError::InvalidDefinition {
                message: format!("name '{}' must be kebab-case", self.name),
            });
        }

        if let Some(version) = &self.version {
            parse_version(version).map_err(|e| CoreError::InvalidDefinition {
                message: format!("version '{}': {}", version, e),
            })?;
        }

        if self.requirements.modules.contains_key(&self.name) {
            return Err(CoreError::InvalidDefinition {
                message: format!("'{}' depends on itself", self.name),
            });
        }

        Ok(())
    }

    /// Parsed version, if declared
    pub fn parsed_version(&self) -> Option<semver::Version> {
        self.version.as_deref().and_then(|v| parse_version(v).ok())
    }

    /// Release namespace, defaulting to `d8-<name>`
    pub fn namespace(&self) -> String {
        self.namespace
            .clone()
            .unwrap_or_else(|| format!("d8-{}", self.name))
    }
}

/// Load `images_digests.json` from a package directory (empty when absent)
pub fn load_digests(dir: &Path) -> Result<BTreeMap<String, String>> {
    let path = dir.join(DIGESTS_FILE);
    if !path.is_file() {
        return Ok(BTreeMap::new());
    }
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

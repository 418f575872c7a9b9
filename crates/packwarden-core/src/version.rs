//! Lenient versions and range constraints
//!
//! Package authors write constraints in the familiar range syntax
//! (`">= 1.2 < 2.0"`, `"~1.4 || ^2"`, `"1.2.x"`, `"1.0.0 - 1.5.0"`). They are
//! normalized into `semver::VersionReq` alternatives.

use semver::{Version, VersionReq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::{CoreError, Result};

/// Parse a version, accepting a `v` prefix and missing minor/patch parts
pub fn parse_version(input: &str) -> Result<Version> {
    let trimmed = input.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);

    if let Ok(version) = Version::parse(trimmed) {
        return Ok(version);
    }

    // Pad "1" or "1.2" (possibly followed by a pre-release or build suffix)
    let split_at = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split_at);
    let parts = core.split('.').count();
    let padded = match parts {
        1 => format!("{}.0.0{}", core, suffix),
        2 => format!("{}.0{}", core, suffix),
        _ => trimmed.to_string(),
    };

    Ok(Version::parse(&padded)?)
}

/// A version constraint: any alternative must match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    raw: String,
    alternatives: Vec<VersionReq>,
}

impl Constraint {
    pub fn parse(input: &str) -> Result<Self> {
        let raw = input.trim().to_string();
        if raw.is_empty() {
            return Err(CoreError::InvalidConstraint {
                constraint: input.to_string(),
                message: "empty constraint".to_string(),
            });
        }

        let alternatives = raw
            .split("||")
            .map(|alt| {
                let normalized = normalize_alternative(alt);
                VersionReq::parse(&normalized).map_err(|e| CoreError::InvalidConstraint {
                    constraint: raw.clone(),
                    message: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { raw, alternatives })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for Constraint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Constraint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Constraint::parse(&raw).map_err(serde::de::Error::custom)
    }
}

fn normalize_alternative(alt: &str) -> String {
    let alt = alt.trim();

    // Hyphen range: "1.2 - 1.4"
    if let Some((low, high)) = alt.split_once(" - ") {
        return format!(">={}, <={}", normalize_version_text(low), normalize_version_text(high));
    }

    let mut comparators: Vec<String> = Vec::new();
    let mut pending_op: Option<String> = None;

    for token in alt.split([' ', ',']).filter(|t| !t.is_empty()) {
        if token.chars().all(|c| "<>=!~^".contains(c)) {
            pending_op = Some(token.to_string());
            continue;
        }

        let token = match pending_op.take() {
            Some(op) => format!("{}{}", op, token),
            None => token.to_string(),
        };
        comparators.push(normalize_comparator(&token));
    }

    if comparators.is_empty() {
        return "*".to_string();
    }
    comparators.join(", ")
}

fn normalize_comparator(token: &str) -> String {
    let split = token
        .find(|c: char| !"<>=!~^".contains(c))
        .unwrap_or(token.len());
    let (op, version) = token.split_at(split);
    let version = normalize_version_text(version);

    if version == "*" {
        return "*".to_string();
    }

    match op {
        // A bare version is an exact match; wildcards stay wildcards
        "" if version.contains('*') => version,
        "" => format!("={}", version),
        "==" => format!("={}", version),
        "~>" => format!("~{}", version),
        op => format!("{}{}", op, version),
    }
}

fn normalize_version_text(text: &str) -> String {
    let text = text.trim();
    let text = text.strip_prefix('v').unwrap_or(text);
    text.split('.')
        .map(|part| match part {
            "x" | "X" => "*",
            other => other,
        })
        .collect::<Vec<_>>()
        .join(".")
}

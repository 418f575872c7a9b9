//! Update policies: selection, modes and update windows

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use kube::ResourceExt;
use std::collections::BTreeMap;

use crate::crd::{LABEL_MODULE, LABEL_SOURCE, ModuleRelease, ModuleUpdatePolicy, UpdateWindow};
use crate::error::{ControllerError, Result};
use crate::store::ModuleStore;

/// Outcome of looking up the policy of a release
#[derive(Debug, Clone)]
pub enum PolicyLookup {
    Found(ModuleUpdatePolicy),
    NotSet,
    NotFound(String),
}

impl PolicyLookup {
    /// Message reported on a release waiting for its policy
    pub fn message(&self) -> Option<String> {
        match self {
            PolicyLookup::Found(_) => None,
            PolicyLookup::NotSet => Some(
                "Update policy not set. Create a suitable ModuleUpdatePolicy object".to_string(),
            ),
            PolicyLookup::NotFound(name) => Some(format!("Update policy {} not found", name)),
        }
    }
}

/// Resolve the policy named by the release's update-policy label
pub async fn release_policy(
    policies: &dyn ModuleStore<ModuleUpdatePolicy>,
    release: &ModuleRelease,
) -> Result<PolicyLookup> {
    let Some(name) = release.update_policy().filter(|n| !n.is_empty()) else {
        return Ok(PolicyLookup::NotSet);
    };
    Ok(match policies.get(name).await? {
        Some(policy) => PolicyLookup::Found(policy),
        None => PolicyLookup::NotFound(name.to_string()),
    })
}

/// Pick the policy whose release selector matches a module of a source.
///
/// Policies without a selector match nothing; more than one match is an error.
pub fn select_policy<'a>(
    policies: &'a [ModuleUpdatePolicy],
    module: &str,
    source: &str,
) -> Result<Option<&'a ModuleUpdatePolicy>> {
    let labels: BTreeMap<String, String> = [
        (LABEL_MODULE.to_string(), module.to_string()),
        (LABEL_SOURCE.to_string(), source.to_string()),
    ]
    .into_iter()
    .collect();

    let matched: Vec<_> = policies
        .iter()
        .filter(|p| {
            p.spec
                .module_release_selector
                .as_ref()
                .is_some_and(|s| s.label_selector.matches(&labels))
        })
        .collect();

    match matched.as_slice() {
        [] => Ok(None),
        [policy] => Ok(Some(*policy)),
        many => Err(ControllerError::AmbiguousPolicy {
            module: module.to_string(),
            policies: many
                .iter()
                .map(|p| p.name_any())
                .collect::<Vec<_>>()
                .join(", "),
        }),
    }
}

fn parse_time(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .map_err(|e| ControllerError::InvalidWindow(format!("'{}': {}", value, e)))
}

impl UpdateWindow {
    /// Whether `now` (UTC) falls into the window. A window whose `to` is
    /// before `from` spans midnight.
    pub fn is_open(&self, now: DateTime<Utc>) -> Result<bool> {
        let from = parse_time(&self.from)?;
        let to = parse_time(&self.to)?;

        if !self.days.is_empty() {
            let mut allowed = Vec::with_capacity(self.days.len());
            for day in &self.days {
                let weekday: Weekday = day
                    .parse()
                    .map_err(|_| ControllerError::InvalidWindow(format!("unknown day '{}'", day)))?;
                allowed.push(weekday);
            }
            if !allowed.contains(&now.weekday()) {
                return Ok(false);
            }
        }

        let time = NaiveTime::from_hms_opt(now.hour(), now.minute(), 0).unwrap_or(from);
        Ok(if from <= to {
            from <= time && time < to
        } else {
            time >= from || time < to
        })
    }
}

/// No windows means always open
pub fn windows_open(windows: &[UpdateWindow], now: DateTime<Utc>) -> Result<bool> {
    if windows.is_empty() {
        return Ok(true);
    }
    for window in windows {
        if window.is_open(now)? {
            return Ok(true);
        }
    }
    Ok(false)
}

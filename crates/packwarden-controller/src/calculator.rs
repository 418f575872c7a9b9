//! Decides what to do with a pending release
//!
//! The decision looks at every release of the same module:
//!
//! - a lone or forced release is processed
//! - a release older than the deployed or a forced one is skipped
//! - a release with a newer pending patch in the same minor is skipped
//! - a release waits for an older pending release
//! - a release waits when it jumps more than one minor, or a major other
//!   than 0 to 1, past the deployed release

use semver::Version;

use crate::crd::{ModuleRelease, ReleasePhase};
use crate::error::Result;

/// Annotation marking a release deployed regardless of ordering
pub const ANNOTATION_FORCE: &str = "modules.deckhouse.io/force";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingTask {
    Process,
    Skip,
    Await(String),
}

struct Entry<'a> {
    version: Version,
    phase: Option<ReleasePhase>,
    forced: bool,
    name: &'a str,
}

fn is_pending(e: &Entry) -> bool {
    matches!(e.phase, None | Some(ReleasePhase::Pending))
}

/// Channels whose releases may jump several minors at once
pub fn is_lts_channel(channel: &str) -> bool {
    channel.eq_ignore_ascii_case("lts")
}

/// Decide the next step for `release` among all `releases` of its module.
pub fn calculate(
    release: &ModuleRelease,
    releases: &[ModuleRelease],
    lts: bool,
) -> Result<PendingTask> {
    let target = release.version()?;
    let name = release.metadata.name.as_deref().unwrap_or_default();

    let mut entries = Vec::with_capacity(releases.len());
    for r in releases {
        if r.spec.module_name != release.spec.module_name {
            continue;
        }
        let Ok(version) = r.version() else {
            continue;
        };
        entries.push(Entry {
            version,
            phase: r.phase(),
            forced: r
                .metadata
                .annotations
                .as_ref()
                .is_some_and(|a| a.get(ANNOTATION_FORCE).is_some_and(|v| v == "true")),
            name: r.metadata.name.as_deref().unwrap_or_default(),
        });
    }
    entries.sort_by(|a, b| a.version.cmp(&b.version));

    let forced = entries.iter().any(|e| e.name == name && e.forced);
    let others: Vec<&Entry> = entries.iter().filter(|e| e.name != name).collect();
    if others.is_empty() || forced {
        return Ok(PendingTask::Process);
    }

    let deployed = others
        .iter()
        .filter(|e| e.phase == Some(ReleasePhase::Deployed))
        .map(|e| &e.version)
        .max();

    let newer_forced_or_deployed = others.iter().any(|e| {
        (e.forced || e.phase == Some(ReleasePhase::Deployed)) && e.version >= target
    });
    if newer_forced_or_deployed {
        return Ok(PendingTask::Skip);
    }

    let newer_patch = others.iter().filter(|e| is_pending(e)).any(|e| {
        e.version > target && e.version.major == target.major && e.version.minor == target.minor
    });
    if newer_patch {
        return Ok(PendingTask::Skip);
    }

    if let Some(previous) = others
        .iter()
        .filter(|e| is_pending(e))
        .filter(|e| e.version < target)
        .map(|e| &e.version)
        .max()
    {
        return Ok(PendingTask::Await(format!(
            "awaiting for v{} release to be deployed",
            previous
        )));
    }

    if let Some(deployed) = deployed {
        if target.major > deployed.major && !(deployed.major == 0 && target.major == 1) {
            return Ok(PendingTask::Await(format!(
                "major version is greater than deployed {}",
                deployed
            )));
        }
        if !lts && target.major == deployed.major && target.minor > deployed.minor + 1 {
            return Ok(PendingTask::Await(format!(
                "minor version is greater than deployed {} by one",
                deployed
            )));
        }
    }

    Ok(PendingTask::Process)
}

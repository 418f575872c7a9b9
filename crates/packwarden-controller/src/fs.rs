//! Module symlinks
//!
//! Enabled external modules are linked from the modules directory:
//!
//! ```text
//! <modules>/<weight>-<module> -> ../<module>/v<version>
//! <modules>/<weight>-<module> -> ../<module>/dev
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

use crate::error::Result;

static LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)-([a-z0-9]([-a-z0-9]*[a-z0-9])?)$").expect("valid regex"));

/// A module found in the modules directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedModule {
    pub name: String,
    pub weight: u32,
    /// Resolved module directory
    pub path: PathBuf,
    /// Name of the target directory: `v<version>` or `dev`
    pub version: String,
}

/// Manages `<weight>-<module>` links of one modules directory
#[derive(Debug, Clone)]
pub struct ModuleLinks {
    downloaded_dir: PathBuf,
    modules_dir: PathBuf,
}

impl ModuleLinks {
    pub fn new(downloaded_dir: impl Into<PathBuf>, modules_dir: impl Into<PathBuf>) -> Self {
        Self {
            downloaded_dir: downloaded_dir.into(),
            modules_dir: modules_dir.into(),
        }
    }

    pub fn downloaded_dir(&self) -> &Path {
        &self.downloaded_dir
    }

    pub fn modules_dir(&self) -> &Path {
        &self.modules_dir
    }

    /// Downloaded directory of a module version (`v1.2.3` or `dev`)
    pub fn module_dir(&self, module: &str, version_dir: &str) -> PathBuf {
        self.downloaded_dir.join(module).join(version_dir)
    }

    /// Current link of a module, whatever its weight
    pub fn find(&self, module: &str) -> Result<Option<PathBuf>> {
        if !self.modules_dir.is_dir() {
            return Ok(None);
        }
        for entry in std::fs::read_dir(&self.modules_dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let Some(caps) = LINK_RE.captures(&file_name) else {
                continue;
            };
            if &caps[2] == module {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }

    /// Point `<weight>-<module>` at a downloaded version, replacing any
    /// previous link of the module
    pub fn relink(&self, module: &str, weight: u32, version_dir: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.modules_dir)?;
        self.remove(module)?;

        let link = self.modules_dir.join(format!("{}-{}", weight, module));
        let target = self.link_target(module, version_dir);
        std::os::unix::fs::symlink(&target, &link)?;

        tracing::info!(
            module = %module,
            link = %link.display(),
            target = %target.display(),
            "module linked"
        );
        Ok(link)
    }

    /// Relative target when the modules directory sits inside the
    /// downloaded directory, absolute otherwise
    fn link_target(&self, module: &str, version_dir: &str) -> PathBuf {
        if self.modules_dir.parent() == Some(self.downloaded_dir.as_path()) {
            Path::new("..").join(module).join(version_dir)
        } else {
            self.module_dir(module, version_dir)
        }
    }

    /// Remove the link of a module; returns whether one existed
    pub fn remove(&self, module: &str) -> Result<bool> {
        match self.find(module)? {
            Some(link) => {
                std::fs::remove_file(&link)?;
                tracing::debug!(module = %module, link = %link.display(), "module link removed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether the module link resolves to the given downloaded version
    pub fn is_linked_to(&self, module: &str, version_dir: &str) -> Result<bool> {
        let Some(link) = self.find(module)? else {
            return Ok(false);
        };
        let expected = self.module_dir(module, version_dir);
        match (std::fs::canonicalize(&link), std::fs::canonicalize(&expected)) {
            (Ok(actual), Ok(expected)) => Ok(actual == expected),
            _ => Ok(false),
        }
    }

    /// Remove a downloaded version directory if present
    pub fn remove_module_dir(&self, module: &str, version_dir: &str) -> Result<()> {
        let dir = self.module_dir(module, version_dir);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Every linked module whose target exists, sorted by weight then name
    pub fn discover(&self) -> Result<Vec<LinkedModule>> {
        let mut modules = Vec::new();
        if !self.modules_dir.is_dir() {
            return Ok(modules);
        }

        for entry in std::fs::read_dir(&self.modules_dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(caps) = LINK_RE.captures(&file_name) else {
                continue;
            };
            let Ok(weight) = caps[1].parse::<u32>() else {
                continue;
            };
            let path = match std::fs::canonicalize(entry.path()) {
                Ok(path) if path.is_dir() => path,
                _ => {
                    tracing::warn!(link = %file_name, "skip dangling module link");
                    continue;
                }
            };
            let version = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            modules.push(LinkedModule {
                name: caps[2].to_string(),
                weight,
                path,
                version,
            });
        }

        modules.sort_by(|a, b| a.weight.cmp(&b.weight).then_with(|| a.name.cmp(&b.name)));
        Ok(modules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn links(tmp: &TempDir) -> ModuleLinks {
        let downloaded = tmp.path().join("downloaded");
        ModuleLinks::new(&downloaded, downloaded.join("modules"))
    }

    #[test]
    fn test_relink_replaces_previous_weight() {
        let tmp = TempDir::new().unwrap();
        let links = links(&tmp);
        std::fs::create_dir_all(links.module_dir("echo", "v1.2.3")).unwrap();
        std::fs::create_dir_all(links.module_dir("echo", "v1.2.4")).unwrap();

        links.relink("echo", 900, "v1.2.3").unwrap();
        assert!(links.is_linked_to("echo", "v1.2.3").unwrap());

        let link = links.relink("echo", 910, "v1.2.4").unwrap();
        assert!(link.ends_with("910-echo"));
        assert_eq!(
            std::fs::read_link(&link).unwrap(),
            Path::new("../echo/v1.2.4")
        );
        assert!(!links.modules_dir().join("900-echo").exists());
        assert!(links.is_linked_to("echo", "v1.2.4").unwrap());
        assert!(!links.is_linked_to("echo", "v1.2.3").unwrap());
    }

    #[test]
    fn test_absolute_target_outside_downloaded() {
        let tmp = TempDir::new().unwrap();
        let links = ModuleLinks::new(tmp.path().join("downloaded"), tmp.path().join("links"));
        std::fs::create_dir_all(links.module_dir("echo", "dev")).unwrap();

        let link = links.relink("echo", 900, "dev").unwrap();
        assert!(std::fs::read_link(&link).unwrap().is_absolute());
        assert!(links.is_linked_to("echo", "dev").unwrap());
    }

    #[test]
    fn test_remove_and_find() {
        let tmp = TempDir::new().unwrap();
        let links = links(&tmp);
        assert!(!links.remove("echo").unwrap());

        std::fs::create_dir_all(links.module_dir("echo", "dev")).unwrap();
        links.relink("echo", 900, "dev").unwrap();
        assert!(links.find("echo").unwrap().is_some());
        assert!(links.find("ech").unwrap().is_none());

        assert!(links.remove("echo").unwrap());
        assert!(links.find("echo").unwrap().is_none());
    }

    #[test]
    fn test_discover_sorted_and_skips_dangling() {
        let tmp = TempDir::new().unwrap();
        let links = links(&tmp);
        for (module, weight) in [("parca", 920), ("echo", 910), ("zeta", 910)] {
            std::fs::create_dir_all(links.module_dir(module, "v1.0.0")).unwrap();
            links.relink(module, weight, "v1.0.0").unwrap();
        }
        links.relink("ghost", 100, "v9.9.9").unwrap();
        std::fs::write(links.modules_dir().join("README"), "x").unwrap();

        let found = links.discover().unwrap();
        let names: Vec<_> = found.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "zeta", "parca"]);
        assert_eq!(found[0].version, "v1.0.0");
        assert_eq!(found[0].weight, 910);
    }
}

//! Release controller
//!
//! Moves `ModuleRelease` objects through their phases:
//!
//! ```text
//! (none) -> Pending -> Deployed -> Superseded
//!              |  \
//!              |   -> Skipped
//!               -> Suspended          (validation failed)
//! Deployed -> Terminating -> (gone)   (deletion with exist-on-fs finalizer)
//! ```
//!
//! A deployed release has its module tree downloaded into
//! `<downloaded>/<module>/v<version>` and linked from the modules directory.
//! Every change of the linked trees is followed by a restart request.

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use kube::runtime::controller::Action;
use packwarden_core::Definition;
use packwarden_core::definition::DEFAULT_WEIGHT;
use packwarden_repo::{ModuleDownloader, RegistryClient};
use std::sync::Arc;
use std::time::Duration;

use crate::calculator::{PendingTask, calculate, is_lts_channel};
use crate::crd::{
    FINALIZER_EXIST_ON_FS, FinalizerExt, LABEL_SOURCE, ModuleRelease, ReleasePhase, UpdateMode,
};
use crate::error::{ControllerError, Result};
use crate::fs::ModuleLinks;
use crate::policy::{PolicyLookup, release_policy, windows_open};
use crate::restart::Restarter;
use crate::store::Stores;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Outdated releases kept per module
pub const DEFAULT_KEEP_OUTDATED: usize = 3;

pub const MESSAGE_AWAITING_APPROVAL: &str = "awaiting approval";
pub const MESSAGE_AWAITING_WINDOW: &str = "awaiting window";
pub const MESSAGE_OVERRIDDEN: &str = "overridden by ModulePullOverride";

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ReleaseConfig {
    pub check_interval: Duration,
    pub keep_outdated: usize,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            keep_outdated: DEFAULT_KEEP_OUTDATED,
        }
    }
}

pub struct ReleaseController {
    stores: Stores,
    registry: Arc<dyn RegistryClient>,
    links: ModuleLinks,
    restarter: Arc<dyn Restarter>,
    config: ReleaseConfig,
    clock: Clock,
}

impl ReleaseController {
    pub fn new(
        stores: Stores,
        registry: Arc<dyn RegistryClient>,
        links: ModuleLinks,
        restarter: Arc<dyn Restarter>,
    ) -> Self {
        Self {
            stores,
            registry,
            links,
            restarter,
            config: ReleaseConfig::default(),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_config(mut self, config: ReleaseConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the time source used for update windows
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub async fn reconcile(&self, name: &str) -> Result<Action> {
        let Some(mut release) = self.stores.releases.get(name).await? else {
            return Ok(Action::await_change());
        };

        if release.is_deleting() {
            return self.delete_release(release).await;
        }

        match release.phase() {
            None => {
                release.set_phase(ReleasePhase::Pending, "");
                let release = self.save(release).await?;
                self.handle_pending(release).await
            }
            Some(ReleasePhase::Pending) => self.handle_pending(release).await,
            Some(ReleasePhase::Deployed) => self.ensure_deployed(release).await,
            Some(phase) if phase.is_outdated() => {
                self.cleanup(&release.spec.module_name).await?;
                Ok(Action::await_change())
            }
            Some(_) => Ok(Action::await_change()),
        }
    }

    /// Write metadata and spec, then the status
    async fn save(&self, release: ModuleRelease) -> Result<ModuleRelease> {
        let status = release.status.clone();
        let mut updated = self.stores.releases.update(&release).await?;
        updated.status = status;
        self.stores.releases.update_status(&updated).await
    }

    async fn set_message(&self, mut release: ModuleRelease, message: &str) -> Result<()> {
        if release.message() == message {
            return Ok(());
        }
        let phase = release.phase().unwrap_or_default();
        release.set_phase(phase, message);
        self.stores.releases.update_status(&release).await?;
        Ok(())
    }

    pub async fn module_releases(&self, module: &str) -> Result<Vec<ModuleRelease>> {
        let mut releases: Vec<_> = self
            .stores
            .releases
            .list()
            .await?
            .into_iter()
            .filter(|r| r.spec.module_name == module)
            .collect();
        releases.sort_by_key(|r| r.version().ok());
        Ok(releases)
    }

    async fn handle_pending(&self, release: ModuleRelease) -> Result<Action> {
        let interval = self.config.check_interval;
        let name = release.name_any();
        let module = release.spec.module_name.clone();

        let policy = match release_policy(self.stores.policies.as_ref(), &release).await? {
            PolicyLookup::Found(policy) => policy,
            lookup => {
                let message = lookup.message().unwrap_or_default();
                tracing::debug!(release = %name, message = %message, "release has no policy");
                self.set_message(release, &message).await?;
                return Ok(Action::requeue(interval));
            }
        };

        let mode = policy.spec.update.mode;
        if mode == UpdateMode::Ignore {
            return Ok(Action::requeue(interval * 4));
        }

        let releases = self.module_releases(&module).await?;
        let lts = is_lts_channel(&policy.spec.release_channel);
        match calculate(&release, &releases, lts)? {
            PendingTask::Skip => {
                tracing::info!(release = %name, "release skipped");
                let mut release = release;
                release.set_phase(ReleasePhase::Skipped, "");
                self.save(release).await?;
                self.cleanup(&module).await?;
                return Ok(Action::await_change());
            }
            PendingTask::Await(message) => {
                self.set_message(release, &message).await?;
                return Ok(Action::requeue(interval));
            }
            PendingTask::Process => {}
        }

        if self.stores.overrides.get(&module).await?.is_some() {
            self.set_message(release, MESSAGE_OVERRIDDEN).await?;
            return Ok(Action::requeue(interval));
        }

        match mode {
            UpdateMode::Manual if !release.is_approved() => {
                self.set_message(release, MESSAGE_AWAITING_APPROVAL).await?;
                return Ok(Action::requeue(interval));
            }
            UpdateMode::Auto if !windows_open(&policy.spec.update.windows, (self.clock)())? => {
                self.set_message(release, MESSAGE_AWAITING_WINDOW).await?;
                return Ok(Action::requeue(interval));
            }
            _ => {}
        }

        self.deploy(release, releases).await
    }

    async fn downloader(&self, release: &ModuleRelease) -> Result<ModuleDownloader> {
        let source_name = release
            .labels()
            .get(LABEL_SOURCE)
            .cloned()
            .unwrap_or_default();
        let source = self.stores.sources.fetch(&source_name).await?;
        Ok(ModuleDownloader::new(
            self.registry.clone(),
            source.spec.registry.to_config()?,
            self.links.downloaded_dir(),
        ))
    }

    async fn deploy(
        &self,
        mut release: ModuleRelease,
        releases: Vec<ModuleRelease>,
    ) -> Result<Action> {
        let name = release.name_any();
        let module = release.spec.module_name.clone();
        let version = release.version()?;
        let version_dir = format!("v{}", version);

        let downloader = self.downloader(&release).await?;
        let downloaded = match downloader.download_version(&module, &version).await {
            Ok(downloaded) => downloaded,
            Err(e) => {
                tracing::warn!(release = %name, error = %e, "release download failed");
                self.set_message(release, &format!("download error: {}", e)).await?;
                return Ok(Action::requeue(self.config.check_interval));
            }
        };

        let definition = match validate(&module, &downloaded.path) {
            Ok(definition) => definition,
            Err(e) => {
                tracing::warn!(release = %name, error = %e, "release validation failed");
                release.set_phase(ReleasePhase::Suspended, format!("validation failed: {}", e));
                self.save(release).await?;
                self.links.remove_module_dir(&module, &version_dir)?;
                return Ok(Action::await_change());
            }
        };

        let weight = match (definition, release.spec.weight) {
            (Some(def), _) => def.weight,
            (None, 0) => DEFAULT_WEIGHT,
            (None, weight) => weight,
        };
        self.links.relink(&module, weight, &version_dir)?;

        for mut previous in releases {
            if previous.name_any() == name || previous.phase() != Some(ReleasePhase::Deployed) {
                continue;
            }
            tracing::info!(release = %previous.name_any(), "release superseded");
            previous.set_phase(ReleasePhase::Superseded, "");
            self.save(previous).await?;
        }

        release.add_finalizer(FINALIZER_EXIST_ON_FS);
        release.spec.weight = weight;
        release.set_phase(ReleasePhase::Deployed, "");
        if let Some(status) = release.status.as_mut() {
            status.size = downloaded.size;
            status.pull_duration = Some(downloaded.pull_duration);
        }
        self.save(release).await?;

        tracing::info!(release = %name, module = %module, version = %version, "release deployed");
        self.restarter
            .restart(&format!("module {} v{} deployed", module, version))?;
        self.cleanup(&module).await?;
        Ok(Action::await_change())
    }

    /// Restore the module link of a deployed release when it went missing
    async fn ensure_deployed(&self, mut release: ModuleRelease) -> Result<Action> {
        let module = release.spec.module_name.clone();
        let version = release.version()?;
        let version_dir = format!("v{}", version);

        if release.add_finalizer(FINALIZER_EXIST_ON_FS) {
            release = self.stores.releases.update(&release).await?;
        }

        if self.links.is_linked_to(&module, &version_dir)?
            || self.stores.overrides.get(&module).await?.is_some()
        {
            return Ok(Action::requeue(self.config.check_interval));
        }

        tracing::info!(release = %release.name_any(), "restoring missing module link");
        let downloaded = self
            .downloader(&release)
            .await?
            .download_version(&module, &version)
            .await?;
        let weight = match release.spec.weight {
            0 => DEFAULT_WEIGHT,
            weight => weight,
        };
        self.links.relink(&module, weight, &version_dir)?;
        tracing::debug!(path = %downloaded.path.display(), "module restored");
        self.restarter
            .restart(&format!("module {} v{} restored", module, version))?;
        Ok(Action::requeue(self.config.check_interval))
    }

    async fn delete_release(&self, mut release: ModuleRelease) -> Result<Action> {
        if !release.has_finalizer(FINALIZER_EXIST_ON_FS) {
            return Ok(Action::await_change());
        }

        let name = release.name_any();
        let module = release.spec.module_name.clone();
        let was_deployed = release.phase() == Some(ReleasePhase::Deployed);

        if release.phase() != Some(ReleasePhase::Terminating) {
            release.set_phase(ReleasePhase::Terminating, "");
            release = self.stores.releases.update_status(&release).await?;
        }

        if let Ok(version) = release.version() {
            self.links
                .remove_module_dir(&module, &format!("v{}", version))?;
        }
        if was_deployed {
            self.links.remove(&module)?;
            self.restarter
                .restart(&format!("module {} release {} deleted", module, name))?;
        }

        release.remove_finalizer(FINALIZER_EXIST_ON_FS);
        self.stores.releases.update(&release).await?;
        tracing::info!(release = %name, "release deleted");
        Ok(Action::await_change())
    }

    /// Delete all but the newest outdated releases of a module
    pub async fn cleanup(&self, module: &str) -> Result<usize> {
        let mut outdated: Vec<_> = self
            .module_releases(module)
            .await?
            .into_iter()
            .filter(|r| r.phase().is_some_and(|p| p.is_outdated()) && !r.is_deleting())
            .collect();
        outdated.reverse();

        let mut deleted = 0;
        for release in outdated.into_iter().skip(self.config.keep_outdated) {
            tracing::debug!(release = %release.name_any(), "deleting outdated release");
            self.stores.releases.delete(&release.name_any()).await?;
            deleted += 1;
        }
        Ok(deleted)
    }
}

/// Check the downloaded tree; the definition is optional
fn validate(module: &str, path: &std::path::Path) -> Result<Option<Definition>> {
    let Some(definition) = Definition::load(path)? else {
        return Ok(None);
    };
    if definition.name != module {
        return Err(ControllerError::Core(
            packwarden_core::CoreError::InvalidDefinition {
                message: format!(
                    "definition name '{}' does not match module '{}'",
                    definition.name, module
                ),
            },
        ));
    }
    Ok(Some(definition))
}

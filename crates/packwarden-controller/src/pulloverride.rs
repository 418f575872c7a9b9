//! Pull override controller
//!
//! A `ModulePullOverride` named after a module pins that module to an image
//! tag of its source. The image is downloaded into `<downloaded>/<module>/dev`
//! and linked in place of the released version until the override is removed.

use chrono::Utc;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use packwarden_core::Definition;
use packwarden_repo::downloader::DEV_DIR;
use packwarden_repo::{ModuleDownloader, RegistryClient};
use std::sync::Arc;
use std::time::Duration;

use crate::crd::{
    ANNOTATION_REGISTRY_CHANGED, ANNOTATION_RENEW, FINALIZER_EXIST_ON_FS, FinalizerExt,
    ModulePullOverride,
};
use crate::error::Result;
use crate::fs::ModuleLinks;
use crate::restart::Restarter;
use crate::store::Stores;

pub const DEFAULT_OVERRIDE_INTERVAL: Duration = Duration::from_secs(60);

pub const MESSAGE_READY: &str = "Ready";

pub struct PullOverrideController {
    stores: Stores,
    registry: Arc<dyn RegistryClient>,
    links: ModuleLinks,
    restarter: Arc<dyn Restarter>,
}

impl PullOverrideController {
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
        }
    }

    pub async fn reconcile(&self, name: &str) -> Result<Action> {
        let Some(pin) = self.stores.overrides.get(name).await? else {
            return Ok(Action::await_change());
        };
        if pin.is_deleting() {
            return self.delete_override(pin).await;
        }

        let interval = pin.spec.scan_interval.unwrap_or(DEFAULT_OVERRIDE_INTERVAL);
        let module = pin.name_any();

        let Some(target) = self.stores.modules.get(&module).await? else {
            return self.fail(pin, "module not found", interval).await;
        };
        if target.is_embedded() {
            return self.fail(pin, "module is embedded", interval).await;
        }
        if target.is_disabled() {
            return self.fail(pin, "module is disabled", interval).await;
        }
        if pin.spec.source.is_empty() {
            return self.fail(pin, "no source", interval).await;
        }
        let Some(source) = self.stores.sources.get(&pin.spec.source).await? else {
            return self.fail(pin, "source not found", interval).await;
        };

        let downloader = ModuleDownloader::new(
            self.registry.clone(),
            source.spec.registry.to_config()?,
            self.links.downloaded_dir(),
        );
        let tag = pin.spec.image_tag.clone();

        let digest = match downloader.image_digest(&module, &tag).await {
            Ok(digest) => digest,
            Err(e) => {
                return self.fail(pin, &format!("Download error: {}", e), interval).await;
            }
        };

        let renew = pin.annotations().contains_key(ANNOTATION_RENEW)
            || pin.annotations().contains_key(ANNOTATION_REGISTRY_CHANGED);
        let current = pin.status.as_ref().is_some_and(|s| s.image_digest == digest);
        if !renew && current && self.links.is_linked_to(&module, DEV_DIR)? {
            return Ok(Action::requeue(interval));
        }

        let downloaded = match downloader.download_dev(&module, &tag).await {
            Ok(downloaded) => downloaded,
            Err(e) => {
                return self.fail(pin, &format!("Download error: {}", e), interval).await;
            }
        };

        let definition = match Definition::load(&downloaded.path) {
            Ok(Some(definition)) if definition.name == module => definition,
            Ok(Some(definition)) => {
                let message = format!(
                    "Validation error: definition name '{}' does not match module '{}'",
                    definition.name, module
                );
                return self.fail(pin, &message, interval).await;
            }
            Ok(None) => return self.fail(pin, "no definition", interval).await,
            Err(e) => {
                return self.fail(pin, &format!("Validation error: {}", e), interval).await;
            }
        };

        if let Err(e) = self.links.relink(&module, definition.weight, DEV_DIR) {
            return self.fail(pin, &format!("Enable error: {}", e), interval).await;
        }

        let mut pin = pin;
        pin.annotations_mut().remove(ANNOTATION_RENEW);
        pin.annotations_mut().remove(ANNOTATION_REGISTRY_CHANGED);
        pin.add_finalizer(FINALIZER_EXIST_ON_FS);
        let mut pin = self.stores.overrides.update(&pin).await?;

        let status = pin.status.get_or_insert_with(Default::default);
        status.updated_at = Some(Utc::now());
        status.message = MESSAGE_READY.to_string();
        status.image_digest = downloaded.digest.unwrap_or(digest);
        status.weight = definition.weight;
        self.stores.overrides.update_status(&pin).await?;

        tracing::info!(module = %module, tag = %tag, "module pinned to image tag");
        self.restarter
            .restart(&format!("module {} overridden with {}", module, tag))?;
        Ok(Action::requeue(interval))
    }

    async fn fail(
        &self,
        mut pin: ModulePullOverride,
        message: &str,
        interval: Duration,
    ) -> Result<Action> {
        tracing::debug!(module = %pin.name_any(), message = %message, "pull override not applied");
        let status = pin.status.get_or_insert_with(Default::default);
        if status.message != message {
            status.message = message.to_string();
            status.updated_at = Some(Utc::now());
            self.stores.overrides.update_status(&pin).await?;
        }
        Ok(Action::requeue(interval))
    }

    async fn delete_override(&self, mut pin: ModulePullOverride) -> Result<Action> {
        if !pin.has_finalizer(FINALIZER_EXIST_ON_FS) {
            return Ok(Action::await_change());
        }

        let module = pin.name_any();
        if self.links.is_linked_to(&module, DEV_DIR)? {
            self.links.remove(&module)?;
        }
        self.links.remove_module_dir(&module, DEV_DIR)?;
        self.restarter
            .restart(&format!("module {} override removed", module))?;

        pin.remove_finalizer(FINALIZER_EXIST_ON_FS);
        self.stores.overrides.update(&pin).await?;
        tracing::info!(module = %module, "pull override removed");
        Ok(Action::await_change())
    }
}

//! Source controller
//!
//! Scans the registry of every `ModuleSource`, keeps a `Module` object per
//! published module and creates a `ModuleRelease` for the version each
//! module's release channel points at.

use chrono::Utc;
use kube::{Resource, ResourceExt};
use kube::runtime::controller::Action;
use packwarden_core::Definition;
use packwarden_repo::{ModuleDownloader, RegistryClient, ReleaseMetadata, RepoError};
use semver::Version;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::crd::{
    ANNOTATION_FORCE_DELETE, ANNOTATION_REGISTRY_CHANGED, ANNOTATION_REGISTRY_CHECKSUM,
    AvailableModule, FINALIZER_MODULE_EXISTS, FINALIZER_RELEASE_EXISTS, FinalizerExt,
    LABEL_MODULE, LABEL_RELEASE_CHECKSUM, LABEL_SOURCE, LABEL_UPDATE_POLICY, Module, ModuleRelease,
    ModuleReleaseSpec, ModuleSource, ModuleSourceStatus, ModuleSpec, ModuleUpdatePolicy,
    ReleasePhase,
};
use crate::error::{ControllerError, Result};
use crate::policy::select_policy;
use crate::store::Stores;

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(180);
pub const DEFAULT_RELEASE_CHANNEL: &str = "Stable";

pub const MESSAGE_DELETE_BLOCKED: &str = "ModuleSource contains at least 1 Deployed release and cannot be deleted. Please delete ModuleRelease manually to continue";
pub const MESSAGE_SOLE_SOURCE: &str = "ModuleSource is the only source of modules";

pub struct SourceController {
    stores: Stores,
    registry: Arc<dyn RegistryClient>,
    downloaded_dir: PathBuf,
    scan_interval: Duration,
}

impl SourceController {
    pub fn new(
        stores: Stores,
        registry: Arc<dyn RegistryClient>,
        downloaded_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            stores,
            registry,
            downloaded_dir: downloaded_dir.into(),
            scan_interval: DEFAULT_SCAN_INTERVAL,
        }
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub async fn reconcile(&self, name: &str) -> Result<Action> {
        let Some(source) = self.stores.sources.get(name).await? else {
            return Ok(Action::await_change());
        };
        if source.is_deleting() {
            return self.delete_source(source).await;
        }

        let config = source.spec.registry.to_config()?;
        let source = self.sync_checksum(source, config.checksum()).await?;
        let downloader =
            ModuleDownloader::new(self.registry.clone(), config, self.downloaded_dir.clone());

        let modules = match downloader.list_modules().await {
            Ok(modules) => modules,
            Err(e) => {
                tracing::warn!(source = %name, error = %e, "failed to list modules");
                let mut source = source;
                let status = source.status.get_or_insert_with(Default::default);
                status.message = e.to_string();
                self.stores.sources.update_status(&source).await?;
                return Ok(Action::requeue(self.scan_interval));
            }
        };

        let policies = self.stores.policies.list().await?;
        let mut available = Vec::with_capacity(modules.len());
        let mut errors = Vec::new();
        let mut releases_created = false;

        for module in &modules {
            self.ensure_module(module, name).await?;
            let entry = match self
                .sync_module(&source, &downloader, &policies, module)
                .await
            {
                Ok((entry, created)) => {
                    releases_created |= created;
                    entry
                }
                Err(e) => {
                    tracing::warn!(source = %name, module = %module, error = %e, "module sync failed");
                    if matches!(
                        e,
                        ControllerError::Registry(RepoError::ReleaseChannelNotFound { .. })
                    ) {
                        errors.push(format!("{}: {}", module, e));
                    }
                    AvailableModule {
                        name: module.clone(),
                        pull_error: e.to_string(),
                        ..Default::default()
                    }
                }
            };
            available.push(entry);
        }

        let mut source = source;
        let mut finalizers_changed = false;
        if !modules.is_empty() {
            finalizers_changed |= source.add_finalizer(FINALIZER_MODULE_EXISTS);
        }
        if releases_created || self.has_releases(name).await? {
            finalizers_changed |= source.add_finalizer(FINALIZER_RELEASE_EXISTS);
        }
        if finalizers_changed {
            source = self.stores.sources.update(&source).await?;
        }

        source.status = Some(ModuleSourceStatus {
            sync_time: Some(Utc::now()),
            modules_count: available.len(),
            available_modules: available,
            message: errors.join("; "),
        });
        self.stores.sources.update_status(&source).await?;

        tracing::info!(source = %name, modules = modules.len(), "source synced");
        Ok(Action::requeue(self.scan_interval))
    }

    /// Record the registry checksum; overrides of a changed registry are marked for re-download
    async fn sync_checksum(&self, mut source: ModuleSource, checksum: String) -> Result<ModuleSource> {
        let name = source.name_any();
        let previous = source.annotations().get(ANNOTATION_REGISTRY_CHECKSUM).cloned();
        if previous.as_deref() == Some(checksum.as_str()) {
            return Ok(source);
        }

        if previous.is_some() {
            for mut pin in self.stores.overrides.list().await? {
                if pin.spec.source != name {
                    continue;
                }
                tracing::info!(source = %name, module = %pin.name_any(), "registry changed, marking override");
                pin.annotations_mut()
                    .insert(ANNOTATION_REGISTRY_CHANGED.to_string(), "true".to_string());
                self.stores.overrides.update(&pin).await?;
            }
        }

        source
            .annotations_mut()
            .insert(ANNOTATION_REGISTRY_CHECKSUM.to_string(), checksum);
        let status = source.status.clone();
        let mut updated = self.stores.sources.update(&source).await?;
        updated.status = status;
        Ok(updated)
    }

    async fn ensure_module(&self, module: &str, source: &str) -> Result<Module> {
        match self.stores.modules.get(module).await? {
            Some(mut existing) => {
                if existing.spec.available_sources.iter().any(|s| s == source) {
                    return Ok(existing);
                }
                existing.spec.available_sources.push(source.to_string());
                existing.spec.available_sources.sort();
                self.stores.modules.update(&existing).await
            }
            None => {
                tracing::info!(module = %module, source = %source, "registering module");
                let obj = Module::new(
                    module,
                    ModuleSpec {
                        source: Some(source.to_string()),
                        available_sources: vec![source.to_string()],
                        ..Default::default()
                    },
                );
                self.stores.modules.create(&obj).await
            }
        }
    }

    async fn sync_module(
        &self,
        source: &ModuleSource,
        downloader: &ModuleDownloader,
        policies: &[ModuleUpdatePolicy],
        module: &str,
    ) -> Result<(AvailableModule, bool)> {
        let source_name = source.name_any();
        let mut entry = AvailableModule {
            name: module.to_string(),
            ..Default::default()
        };

        if self.stores.overrides.get(module).await?.is_some() {
            entry.overridden = true;
            return Ok((entry, false));
        }

        let policy = select_policy(policies, module, &source_name)?;
        entry.policy = policy.map(|p| p.name_any()).unwrap_or_default();

        let channel = policy
            .map(|p| p.spec.release_channel.as_str())
            .filter(|c| !c.is_empty())
            .or(Some(source.spec.release_channel.as_str()).filter(|c| !c.is_empty()))
            .unwrap_or(DEFAULT_RELEASE_CHANNEL);

        let meta = downloader.fetch_release_metadata(module, channel).await?;
        if !meta.version.pre.is_empty() {
            entry.pull_error = format!("pre-release version v{} is not supported", meta.version);
            return Ok((entry, false));
        }

        let created = self
            .ensure_releases(source, downloader, module, &meta, &entry.policy)
            .await?;
        Ok((entry, created))
    }

    /// Create the release of the channel version, plus intermediate minors
    async fn ensure_releases(
        &self,
        source: &ModuleSource,
        downloader: &ModuleDownloader,
        module: &str,
        meta: &ReleaseMetadata,
        policy: &str,
    ) -> Result<bool> {
        let releases: Vec<_> = self
            .stores
            .releases
            .list()
            .await?
            .into_iter()
            .filter(|r| r.spec.module_name == module)
            .collect();

        let name = release_name(module, &meta.version);
        if let Some(mut existing) = releases.iter().find(|r| r.name_any() == name).cloned() {
            if existing.labels().get(LABEL_RELEASE_CHECKSUM) != Some(&meta.checksum) {
                existing
                    .labels_mut()
                    .insert(LABEL_RELEASE_CHECKSUM.to_string(), meta.checksum.clone());
                existing.spec.changelog = changelog(meta);
                self.stores.releases.update(&existing).await?;
            }
            return Ok(false);
        }

        let deployed = releases
            .iter()
            .filter(|r| r.phase() == Some(ReleasePhase::Deployed))
            .filter_map(|r| r.version().ok())
            .max();
        if deployed.as_ref().is_some_and(|d| *d >= meta.version) {
            return Ok(false);
        }

        let mut versions = match &deployed {
            Some(deployed) => intermediate_versions(
                deployed,
                &meta.version,
                &downloader.list_module_tags(module).await?,
            ),
            None => Vec::new(),
        };
        versions.push(meta.version.clone());

        for version in versions {
            let name = release_name(module, &version);
            if releases.iter().any(|r| r.name_any() == name) {
                continue;
            }
            let release = if version == meta.version {
                new_release(source, module, &version, Some(meta), policy)
            } else {
                new_release(source, module, &version, None, policy)
            };
            tracing::info!(module = %module, release = %name, "creating release");
            self.stores.releases.create(&release).await?;
        }
        Ok(true)
    }

    async fn has_releases(&self, source: &str) -> Result<bool> {
        Ok(self
            .stores
            .releases
            .list()
            .await?
            .iter()
            .any(|r| r.labels().get(LABEL_SOURCE).is_some_and(|s| s == source)))
    }

    async fn delete_source(&self, mut source: ModuleSource) -> Result<Action> {
        let name = source.name_any();
        let force = source
            .annotations()
            .get(ANNOTATION_FORCE_DELETE)
            .is_some_and(|v| v == "true");

        let deployed = self
            .stores
            .releases
            .list()
            .await?
            .iter()
            .any(|r| {
                r.labels().get(LABEL_SOURCE).is_some_and(|s| *s == name)
                    && r.phase() == Some(ReleasePhase::Deployed)
            });

        if deployed && !force {
            tracing::warn!(source = %name, "source deletion blocked by deployed releases");
            return self.block_deletion(&mut source, MESSAGE_DELETE_BLOCKED.to_string()).await;
        }

        let modules = self.stores.modules.list().await?;
        let sole: Vec<String> = modules
            .iter()
            .filter(|m| m.spec.available_sources == [name.as_str()])
            .map(|m| m.name_any())
            .collect();
        if !sole.is_empty() && !force {
            tracing::warn!(source = %name, modules = ?sole, "source deletion blocked by modules");
            if source.remove_finalizer(FINALIZER_RELEASE_EXISTS) {
                source = self.stores.sources.update(&source).await?;
            }
            let message = format!("{}: {}", MESSAGE_SOLE_SOURCE, sole.join(", "));
            return self.block_deletion(&mut source, message).await;
        }

        for mut module in modules {
            let before = module.spec.available_sources.len();
            module.spec.available_sources.retain(|s| *s != name);
            let owned = module.spec.source.as_deref() == Some(name.as_str());
            if owned {
                module.spec.source = None;
            }
            if owned || module.spec.available_sources.len() != before {
                self.stores.modules.update(&module).await?;
            }
        }

        let released = source.remove_finalizer(FINALIZER_RELEASE_EXISTS);
        let registered = source.remove_finalizer(FINALIZER_MODULE_EXISTS);
        if released || registered {
            self.stores.sources.update(&source).await?;
        }
        tracing::info!(source = %name, force, "source deleted");
        Ok(Action::await_change())
    }

    /// Keep the source with `message` in its status and look again later
    async fn block_deletion(&self, source: &mut ModuleSource, message: String) -> Result<Action> {
        let status = source.status.get_or_insert_with(Default::default);
        if status.message != message {
            status.message = message;
            self.stores.sources.update_status(source).await?;
        }
        Ok(Action::requeue(self.scan_interval))
    }
}

pub fn release_name(module: &str, version: &Version) -> String {
    format!("{}-v{}", module, version)
}

fn changelog(meta: &ReleaseMetadata) -> Option<serde_json::Value> {
    Some(meta.changelog.clone()).filter(|c| !c.is_null())
}

fn requirements(definition: &Definition) -> BTreeMap<String, String> {
    let reqs = &definition.requirements;
    let mut out: BTreeMap<String, String> = reqs
        .modules
        .iter()
        .map(|(name, dep)| (name.clone(), dep.constraint.to_string()))
        .collect();
    if let Some(kubernetes) = &reqs.kubernetes {
        out.insert("kubernetes".to_string(), kubernetes.to_string());
    }
    if let Some(deckhouse) = &reqs.deckhouse {
        out.insert("deckhouse".to_string(), deckhouse.to_string());
    }
    out
}

fn new_release(
    source: &ModuleSource,
    module: &str,
    version: &Version,
    meta: Option<&ReleaseMetadata>,
    policy: &str,
) -> ModuleRelease {
    let definition = meta.and_then(|m| m.definition.as_ref());
    let mut release = ModuleRelease::new(
        &release_name(module, version),
        ModuleReleaseSpec {
            module_name: module.to_string(),
            version: format!("v{}", version),
            weight: definition.map(|d| d.weight).unwrap_or_default(),
            changelog: meta.and_then(changelog),
            requirements: definition.map(requirements).unwrap_or_default(),
        },
    );

    let labels = release.labels_mut();
    labels.insert(LABEL_MODULE.to_string(), module.to_string());
    labels.insert(LABEL_SOURCE.to_string(), source.name_any());
    if let Some(meta) = meta {
        labels.insert(LABEL_RELEASE_CHECKSUM.to_string(), meta.checksum.clone());
    }
    if !policy.is_empty() {
        labels.insert(LABEL_UPDATE_POLICY.to_string(), policy.to_string());
    }
    release.meta_mut().owner_references = source.owner_ref(&()).map(|r| vec![r]);
    release
}

/// Highest published patch of every minor strictly between `deployed` and `target`
pub fn intermediate_versions(deployed: &Version, target: &Version, tags: &[String]) -> Vec<Version> {
    if deployed.major != target.major {
        return Vec::new();
    }

    let mut highest: BTreeMap<u64, Version> = BTreeMap::new();
    for tag in tags {
        let Ok(version) = Version::parse(tag.trim_start_matches('v')) else {
            continue;
        };
        if version.major != target.major
            || !version.pre.is_empty()
            || version.minor <= deployed.minor
            || version.minor >= target.minor
        {
            continue;
        }
        let entry = highest.entry(version.minor).or_insert_with(|| version.clone());
        if version > *entry {
            *entry = version;
        }
    }
    highest.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        LabelSelector, ModulePullOverride, ModulePullOverrideSpec, ModuleReleaseSelector,
        ModuleSourceSpec, ModuleUpdatePolicySpec, RegistrySpec,
    };
    use crate::store::{MockStores, ModuleStore};
    use packwarden_repo::MockRegistryClient;
    use tempfile::TempDir;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_intermediate_versions() {
        let versions = intermediate_versions(
            &Version::new(1, 1, 0),
            &Version::new(1, 4, 0),
            &tags(&["v1.1.3", "v1.2.0", "v1.2.5", "v1.3.1", "v1.4.0", "v1.3.2-rc.1", "latest"]),
        );
        assert_eq!(versions, vec![Version::new(1, 2, 5), Version::new(1, 3, 1)]);

        assert!(
            intermediate_versions(&Version::new(1, 9, 0), &Version::new(2, 0, 0), &tags(&["v1.10.0"]))
                .is_empty()
        );
    }

    struct Fixture {
        tmp: TempDir,
        mocks: MockStores,
        registry: Arc<MockRegistryClient>,
    }

    fn fixture() -> Fixture {
        let mocks = MockStores::new();
        mocks.sources.insert(ModuleSource::new(
            "deckhouse",
            ModuleSourceSpec {
                registry: RegistrySpec {
                    repo: "registry.example.com/modules".to_string(),
                    ..Default::default()
                },
                release_channel: "EarlyAccess".to_string(),
            },
        ));
        let mut selector = LabelSelector::default();
        selector
            .match_labels
            .insert(LABEL_SOURCE.to_string(), "deckhouse".to_string());
        mocks.policies.insert(ModuleUpdatePolicy::new(
            "deckhouse-auto",
            ModuleUpdatePolicySpec {
                module_release_selector: Some(ModuleReleaseSelector {
                    label_selector: selector,
                }),
                ..Default::default()
            },
        ));

        let registry = Arc::new(MockRegistryClient::new());
        registry.add_tag("modules", "echo");
        registry.add_tag("modules", "modules");

        Fixture {
            tmp: TempDir::new().unwrap(),
            mocks,
            registry,
        }
    }

    impl Fixture {
        fn controller(&self) -> SourceController {
            SourceController::new(self.mocks.stores(), self.registry.clone(), self.tmp.path())
        }

        fn publish_channel(&self, channel: &str, version: &str) {
            let version_json = format!(r#"{{"version": "v{}"}}"#, version);
            self.registry
                .add_image(
                    "modules/echo/release",
                    channel,
                    &[
                        ("version.json", version_json.as_bytes()),
                        ("module.yaml", b"name: echo\nweight: 920\n"),
                    ],
                )
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_scan_creates_module_and_release() {
        let f = fixture();
        f.publish_channel("early-access", "1.2.0");

        let action = f.controller().reconcile("deckhouse").await.unwrap();
        assert_eq!(action, Action::requeue(DEFAULT_SCAN_INTERVAL));

        let module = f.mocks.modules.object("echo").unwrap();
        assert_eq!(module.spec.available_sources, vec!["deckhouse"]);

        let release = f.mocks.releases.object("echo-v1.2.0").unwrap();
        assert_eq!(release.spec.weight, 920);
        assert_eq!(release.labels()[LABEL_SOURCE], "deckhouse");
        assert_eq!(release.labels()[LABEL_UPDATE_POLICY], "deckhouse-auto");
        assert!(release.labels().contains_key(LABEL_RELEASE_CHECKSUM));

        let source = f.mocks.sources.object("deckhouse").unwrap();
        assert!(source.has_finalizer(FINALIZER_RELEASE_EXISTS));
        assert!(source.has_finalizer(FINALIZER_MODULE_EXISTS));
        assert!(source.annotations().contains_key(ANNOTATION_REGISTRY_CHECKSUM));
        let status = source.status.unwrap();
        assert_eq!(status.modules_count, 1);
        assert_eq!(status.available_modules[0].policy, "deckhouse-auto");
        assert!(status.message.is_empty());

        f.controller().reconcile("deckhouse").await.unwrap();
        assert_eq!(f.mocks.releases.create_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_channel_reported() {
        let f = fixture();

        f.controller().reconcile("deckhouse").await.unwrap();
        let status = f.mocks.sources.object("deckhouse").unwrap().status.unwrap();
        assert!(status.message.contains("echo"));
        assert!(!status.available_modules[0].pull_error.is_empty());
        assert!(f.mocks.releases.names().is_empty());
    }

    #[tokio::test]
    async fn test_prerelease_rejected() {
        let f = fixture();
        f.publish_channel("early-access", "1.3.0-rc.1");

        f.controller().reconcile("deckhouse").await.unwrap();
        assert!(f.mocks.releases.names().is_empty());
        let status = f.mocks.sources.object("deckhouse").unwrap().status.unwrap();
        assert!(status.available_modules[0].pull_error.contains("pre-release"));
    }

    #[tokio::test]
    async fn test_overridden_module_skipped() {
        let f = fixture();
        f.publish_channel("early-access", "1.2.0");
        f.mocks.overrides.insert(ModulePullOverride::new(
            "echo",
            ModulePullOverrideSpec {
                source: "deckhouse".to_string(),
                image_tag: "pr-1".to_string(),
                scan_interval: None,
            },
        ));

        f.controller().reconcile("deckhouse").await.unwrap();
        assert!(f.mocks.releases.names().is_empty());
        let status = f.mocks.sources.object("deckhouse").unwrap().status.unwrap();
        assert!(status.available_modules[0].overridden);
    }

    #[tokio::test]
    async fn test_registry_change_marks_overrides() {
        let f = fixture();
        f.publish_channel("early-access", "1.2.0");
        f.controller().reconcile("deckhouse").await.unwrap();
        f.mocks.overrides.insert(ModulePullOverride::new(
            "echo",
            ModulePullOverrideSpec {
                source: "deckhouse".to_string(),
                image_tag: "pr-1".to_string(),
                scan_interval: None,
            },
        ));

        let mut source = f.mocks.sources.object("deckhouse").unwrap();
        source.spec.registry.docker_cfg = "e30=".to_string();
        f.mocks.sources.update(&source).await.unwrap();
        f.controller().reconcile("deckhouse").await.unwrap();

        let pin = f.mocks.overrides.object("echo").unwrap();
        assert_eq!(pin.annotations()[ANNOTATION_REGISTRY_CHANGED], "true");
    }

    #[tokio::test]
    async fn test_intermediate_releases_created() {
        let f = fixture();
        let mut deployed = ModuleRelease::new(
            "echo-v1.1.0",
            ModuleReleaseSpec {
                module_name: "echo".to_string(),
                version: "v1.1.0".to_string(),
                ..Default::default()
            },
        );
        deployed.set_phase(ReleasePhase::Deployed, "");
        f.mocks.releases.insert(deployed);
        for tag in ["v1.1.0", "v1.2.0", "v1.2.3", "v1.3.0"] {
            f.registry.add_tag("modules/echo", tag);
        }
        f.publish_channel("early-access", "1.3.0");

        f.controller().reconcile("deckhouse").await.unwrap();
        assert_eq!(
            f.mocks.releases.names(),
            vec!["echo-v1.1.0", "echo-v1.2.3", "echo-v1.3.0"]
        );
        let intermediate = f.mocks.releases.object("echo-v1.2.3").unwrap();
        assert!(!intermediate.labels().contains_key(LABEL_RELEASE_CHECKSUM));
        assert_eq!(intermediate.labels()[LABEL_UPDATE_POLICY], "deckhouse-auto");
    }
}

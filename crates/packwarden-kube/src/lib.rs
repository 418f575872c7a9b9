//! Packwarden Kube - Kubernetes integration for Packwarden
//!
//! This crate provides:
//! - **Hooks**: Hook configuration, the hook index, binding contexts and execution
//! - **Hook Controller**: Kubernetes and schedule bindings of a hook turned into runs
//! - **Events Manager**: Watch-backed monitors with snapshots and locked delivery
//! - **Schedule Manager**: Reference-counted crontabs firing on a channel
//! - **Helm Service**: Change-detecting release upgrades with resource monitors
//! - **Object Patcher**: Hook-requested create, delete and patch operations
//! - **Resources**: Manifest parsing and discovery-backed dynamic APIs

pub mod error;
pub mod events;
pub mod helm;
pub mod hooks;
pub mod monitor;
pub mod patcher;
pub mod resources;
pub mod schedule;

pub use error::{HelmStep, KubeError, Result};
pub use events::{KubeEvent, KubeEventsManager, KubeWatcherEventsManager, MockKubeEventsManager, MonitorConfig};
pub use helm::{
    CHECKSUM_VALUES_KEY, CommandHelmClient, HelmClient, HelmService, MockHelmClient, MockRelease,
    PackageMeta, ReleaseInfo, ReleaseRequest,
};
pub use hooks::{
    BindingContext, BindingExecutionInfo, BindingType, ContextType, Hook, HookCall, HookConfig,
    HookController, HookExecutor, HookIndex, HookInput, HookOutput, HookResult, MAIN_QUEUE,
    MockHookExecutor, ShellHookExecutor, Snapshots, WatchEventType,
};
pub use monitor::{AbsentCallback, MockResourceChecker, ResourceMonitor};
pub use patcher::{
    KubeObjectPatcher, ObjectPatchOperation, ObjectPatcher, ObjectTarget, RecordingPatcher,
    parse_object_patches,
};
pub use resources::{FIELD_MANAGER, ManifestRef, ResourceChecker, ResourceResolver, parse_manifests};
pub use schedule::{ScheduleManager, parse_crontab};

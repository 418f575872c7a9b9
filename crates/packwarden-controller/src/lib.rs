//! Packwarden Controllers - Module distribution through custom resources
//!
//! This crate provides:
//! - **Custom resources**: `Module`, `ModuleSource`, `ModuleRelease`,
//!   `ModulePullOverride` and `ModuleUpdatePolicy`
//! - **Stores**: Typed access to those objects, backed by the API server or memory
//! - **Source controller**: Registry scans creating modules and releases
//! - **Release controller**: Release rollout, update policies and cleanup
//! - **Pull override controller**: Development pins to arbitrary image tags
//! - **Module links**: The `<weight>-<module>` symlinks the runtime loads from
//!
//! Every change of the linked module trees ends with a [`Restarter`] call.

pub mod calculator;
pub mod crd;
pub mod error;
pub mod fs;
pub mod policy;
pub mod pulloverride;
pub mod release;
pub mod restart;
pub mod runner;
pub mod source;
pub mod status;
pub mod store;

pub use calculator::{PendingTask, calculate};
pub use crd::{
    Module, ModulePullOverride, ModuleRelease, ModuleSource, ModuleUpdatePolicy, ReleasePhase,
    UpdateMode,
};
pub use error::{ControllerError, Result};
pub use fs::{LinkedModule, ModuleLinks};
pub use pulloverride::PullOverrideController;
pub use release::{ReleaseConfig, ReleaseController};
pub use restart::{RecordingRestarter, Restarter, SignalRestarter};
pub use runner::{Controllers, Reconciler};
pub use source::SourceController;
pub use status::ModuleStatusSink;
pub use store::{KubeModuleStore, MockModuleStore, MockStores, ModuleStore, Stores};

//! Package hooks
//!
//! A hook is an executable shipped in a package's `hooks/` directory. It
//! declares its bindings through `--config` and is run with a binding context
//! describing why it was triggered.

mod binding_context;
mod config;
mod controller;
mod executor;
mod index;

pub use binding_context::{
    BindingContext, BindingContextMetadata, BindingExecutionInfo, ContextType,
    ObjectAndFilterResult, Snapshots,
};
pub use config::{
    BindingType, FieldSelector, FieldSelectorRequirement, HookConfig, KubernetesConfig,
    LabelSelector, LabelSelectorRequirement, MAIN_QUEUE, NameSelector, NamespaceSelector,
    ReadinessConfig, ScheduleConfig, WatchEventType,
};
pub use controller::HookController;
pub use executor::{
    HookCall, HookExecutor, HookInput, HookOutput, HookResult, MockHookExecutor,
    ShellHookExecutor,
};
pub use index::HookIndex;

use std::path::PathBuf;

/// A discovered hook with its parsed configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Hook {
    /// Path relative to the packages root, e.g. `echo/hooks/startup`
    pub name: String,
    /// Absolute path of the executable
    pub path: PathBuf,
    pub config: HookConfig,
}

impl Hook {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, config: HookConfig) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            config,
        }
    }

    pub fn order(&self, binding: BindingType) -> f64 {
        self.config.order(binding)
    }
}

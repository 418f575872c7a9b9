//! Packwarden Runtime - Package lifecycle runtime
//!
//! This crate provides:
//! - **Queues**: Named FIFO task queues with per-queue workers and retries
//! - **Scheduler**: Dependency graph deciding which packages run and when
//! - **Package Manager**: Loaded packages, their hooks and the Helm run cycle
//! - **Tasks**: Load, settings, startup, run, hook run and disable steps
//! - **Event Handler**: Kubernetes events and crontabs turned into hook runs
//! - **Operator**: The wiring of all of the above, plus a debug server

pub mod app;
pub mod debug;
pub mod error;
pub mod eventhandler;
pub mod global;
pub mod lifecycle;
pub mod loader;
pub mod manager;
pub mod operator;
pub mod queue;
pub mod scheduler;
pub mod status;
pub mod tasks;

pub use app::{Application, ApplicationParts};
pub use error::{ErrorReason, PackageError, Result, RuntimeError};
pub use eventhandler::EventHandler;
pub use global::GlobalValues;
pub use lifecycle::{LifecycleEvent, LifecycleStore, Phase};
pub use loader::PackageLoader;
pub use manager::{ManagerServices, PackageDump, PackageManager, TaskBuilder};
pub use operator::{GLOBAL_QUEUE, Operator, OperatorConfig, PackageUpdate};
pub use queue::{EnqueueOptions, QueueDump, QueueService, Task, WaitGroup};
pub use scheduler::{
    Constraints, GLOBAL_NODE, NodeState, NodeStatus, Package, PackageSpec, Scheduler,
    SchedulerConfig,
};
pub use status::{Condition, ConditionStatus, ConditionType, StatusService, StatusSink};

#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod action;
mod core;
mod dependencies;
mod error;
pub mod executor;
pub mod fs;
mod intern;
#[cfg(feature = "logging")]
pub mod logging;
mod output;
pub mod sandbox;
mod store;
mod task;
pub mod verify;

pub use crate::action::TaskAction;
pub use crate::core::{ArcBytes, ArcStr, Hash32};
pub use crate::dependencies::{
    DependencySettings, TaskDependencySettings, VerificationSetting, infer_dependency_name,
};
pub use crate::error::*;
pub use crate::executor::{Diagnostics, Executor, ExecutorConfig, TaskExecution};
pub use crate::intern::{ArenaStats, ByteStringArena, Handle, InterningArena, StringArena};
pub use crate::output::{Diagnostic, OutputDelegate, Severity, TaskOutput};
pub use crate::store::TaskStore;
pub use crate::task::{ConfiguredTarget, Task, TaskBuilder, TaskIdentifier, TaskPayload};

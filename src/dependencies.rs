//! Declared dependencies and the inference of logical dependency names.
//!
//! A task declares the *logical* dependencies it is allowed to use, such as
//! `Foundation` or `z`. The trace of a real execution only contains paths, so
//! every accessed path is mapped back to a logical name with
//! [`infer_dependency_name`] before the two sides are compared.

use std::collections::BTreeSet;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// Explicit override of whether a task's dependencies are verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationSetting {
    Enabled,
    Disabled,
}

/// Dependency contract of a single task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySettings {
    /// Declared logical dependency names, ordered and unique.
    pub dependencies: BTreeSet<String>,
    /// Whether real accesses are checked against `dependencies`.
    pub verification: bool,
}

impl DependencySettings {
    /// Builds the settings from their configured values.
    ///
    /// Without an explicit [`VerificationSetting`], verification is turned on
    /// exactly when at least one dependency is declared. An explicit setting
    /// always wins.
    pub fn new(
        dependencies: Option<Vec<String>>,
        verification: Option<VerificationSetting>,
    ) -> Self {
        let dependencies: BTreeSet<String> = dependencies.into_iter().flatten().collect();

        let verification = match verification {
            Some(VerificationSetting::Enabled) => true,
            Some(VerificationSetting::Disabled) => false,
            None => !dependencies.is_empty(),
        };

        Self {
            dependencies,
            verification,
        }
    }

    pub fn declares(&self, name: &str) -> bool {
        self.dependencies.contains(name)
    }
}

/// Per-task verification configuration carried in the task payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDependencySettings {
    /// Where the instrumented tool writes the trace of this invocation.
    pub trace_file: Utf8PathBuf,
    pub dependency_settings: DependencySettings,
}

/// Infers the logical dependency a path belongs to.
///
/// A path inside a framework bundle maps to the bundle name, the closest
/// enclosing `.framework` directory winning. A static archive named
/// `lib<name>.a` maps to `<name>`. Anything else has no inferable name.
pub fn infer_dependency_name(path: &Utf8Path) -> Option<String> {
    framework_name(path).or_else(|| library_name(path))
}

fn framework_name(path: &Utf8Path) -> Option<String> {
    path.ancestors()
        .find(|ancestor| ancestor.extension() == Some("framework"))
        .and_then(Utf8Path::file_stem)
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
}

fn library_name(path: &Utf8Path) -> Option<String> {
    if path.extension() != Some("a") {
        return None;
    }

    path.file_stem()
        .and_then(|stem| stem.strip_prefix("lib"))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

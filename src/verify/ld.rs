use std::collections::BTreeSet;

use camino::Utf8PathBuf;
use serde::Deserialize;

use crate::dependencies::DependencySettings;
use crate::verify::{Adapter, TaskExecutionContext, verify_files};

/// Libraries every linked image depends on without declaring them.
const INHERENT_DEPENDENCIES: &[&str] = &["libSystem.B.tbd", "libobjc.A.tbd"];

/// Verification adapter for the linker.
///
/// The linker accepts a shared trace file through `LD_TRACE_FILE`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LdAdapter;

impl Adapter for LdAdapter {
    type Trace = LdTrace;

    fn outer_trace_file_env_var(&self) -> Option<&str> {
        Some("LD_TRACE_FILE")
    }

    fn verify(
        &self,
        ctx: &TaskExecutionContext<'_>,
        trace: LdTrace,
        settings: &DependencySettings,
    ) -> anyhow::Result<bool> {
        let files = trace.all().into_iter().filter(|path| {
            path.file_name()
                .is_none_or(|name| !INHERENT_DEPENDENCIES.contains(&name))
        });

        Ok(verify_files(ctx, files, settings))
    }
}

/// What the linker reports to have loaded, by load kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LdTrace {
    #[serde(default)]
    pub dynamic: Vec<Utf8PathBuf>,
    #[serde(default)]
    pub weak: Vec<Utf8PathBuf>,
    #[serde(default)]
    pub re_exports: Vec<Utf8PathBuf>,
    #[serde(default)]
    pub upward_dynamic: Vec<Utf8PathBuf>,
    #[serde(default)]
    pub delay_init: Vec<Utf8PathBuf>,
    #[serde(default)]
    pub archives: Vec<Utf8PathBuf>,
}

impl LdTrace {
    /// Every loaded file, whatever the load kind.
    pub fn all(self) -> BTreeSet<Utf8PathBuf> {
        [
            self.dynamic,
            self.weak,
            self.re_exports,
            self.upward_dynamic,
            self.delay_init,
            self.archives,
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

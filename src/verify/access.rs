use serde::Deserialize;

use camino::Utf8PathBuf;

use crate::dependencies::DependencySettings;
use crate::verify::{Adapter, TaskExecutionContext, verify_files};

/// Verification adapter for tools that record a generic file access trace.
#[derive(Debug, Clone, Default)]
pub struct AccessTraceAdapter {
    outer_trace_env: Option<String>,
}

impl AccessTraceAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts a shared trace file through the environment variable `var`.
    pub fn with_outer_trace_env(var: impl Into<String>) -> Self {
        Self {
            outer_trace_env: Some(var.into()),
        }
    }
}

impl Adapter for AccessTraceAdapter {
    type Trace = AccessTrace;

    fn outer_trace_file_env_var(&self) -> Option<&str> {
        self.outer_trace_env.as_deref()
    }

    fn verify(
        &self,
        ctx: &TaskExecutionContext<'_>,
        trace: AccessTrace,
        settings: &DependencySettings,
    ) -> anyhow::Result<bool> {
        let consumed = trace
            .accesses
            .into_iter()
            .filter(|access| access.kind != AccessKind::Write)
            .map(|access| access.path);

        Ok(verify_files(ctx, consumed, settings))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    #[default]
    Read,
    Write,
    Stat,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileAccess {
    pub path: Utf8PathBuf,
    #[serde(default)]
    pub kind: AccessKind,
}

/// Files a tool touched, in access order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AccessTrace {
    #[serde(default)]
    pub accesses: Vec<FileAccess>,
}

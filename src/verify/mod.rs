//! Trace-file based dependency verification.
//!
//! A task whose payload enables verification runs its tool with tracing
//! turned on. Once the tool exits successfully, the trace of the files it
//! really touched is decoded and compared with the logical dependencies the
//! task declared. Accessing an undeclared dependency fails the task even
//! though the process itself succeeded.
//!
//! ## Adapters
//!
//! Every trace-capable tool gets an [`Adapter`], which knows how to run the
//! tool, what its trace record looks like and how to turn that record into a
//! list of accessed files. [`verify_files`] holds the comparison shared by all
//! of them.
//!
//! ## Outer trace files
//!
//! A driver that fans out into nested invocations may ask each of them to
//! append its trace to one shared file, named in an environment variable.
//! The pipeline takes that variable away from the child, appends the child's
//! own trace to the shared file itself and verifies only the child's slice.

mod access;
mod ld;
mod trace;

use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::process::Stdio;

use camino::{Utf8Path, Utf8PathBuf};
use serde::de::DeserializeOwned;

use crate::dependencies::{DependencySettings, infer_dependency_name};
use crate::error::{PipelineError, SpawnError};
use crate::fs::FileSystem;
use crate::output::{Diagnostic, OutputDelegate, Severity};
use crate::task::Task;

pub use crate::verify::access::{AccessKind, AccessTrace, AccessTraceAdapter, FileAccess};
pub use crate::verify::ld::{LdAdapter, LdTrace};
pub use crate::verify::trace::read_and_maybe_merge;

/// Outcome of running a task's underlying command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResult {
    Succeeded,
    Failed,
    Cancelled,
}

/// Where a single invocation is in its lifecycle.
///
/// `NotStarted -> Executing -> (Succeeded | Failed)`, and when verification
/// is enabled a successful execution moves on to `Verified` or
/// `VerificationFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    Executing,
    Succeeded,
    Failed,
    Verified,
    VerificationFailed,
}

/// Final verdict of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Execution {
    pub result: CommandResult,
    pub phase: Phase,
}

impl Execution {
    pub(crate) fn executed(result: CommandResult) -> Self {
        let phase = match result {
            CommandResult::Succeeded => Phase::Succeeded,
            CommandResult::Failed | CommandResult::Cancelled => Phase::Failed,
        };

        Self { result, phase }
    }

    pub(crate) fn failed() -> Self {
        Self {
            result: CommandResult::Failed,
            phase: Phase::Failed,
        }
    }
}

/// Everything a task needs while it runs.
#[derive(Clone, Copy)]
pub struct TaskExecutionContext<'a> {
    pub task: &'a Task,
    pub fs: &'a dyn FileSystem,
    pub output: &'a dyn OutputDelegate,
}

impl<'a> TaskExecutionContext<'a> {
    pub fn new(task: &'a Task, fs: &'a dyn FileSystem, output: &'a dyn OutputDelegate) -> Self {
        Self { task, fs, output }
    }

    pub fn error(&self, message: impl Display) {
        self.output.emit(Diagnostic {
            severity: Severity::Error,
            message: message.to_string(),
        });
    }

    pub fn warning(&self, message: impl Display) {
        self.output.emit(Diagnostic {
            severity: Severity::Warning,
            message: message.to_string(),
        });
    }

    pub fn note(&self, message: impl Display) {
        self.output.emit(Diagnostic {
            severity: Severity::Note,
            message: message.to_string(),
        });
    }
}

/// Tool-specific half of the verification pipeline.
pub trait Adapter: Send + Sync {
    /// Decoded trace record written by the tool.
    type Trace: DeserializeOwned;

    /// Environment variable through which the tool accepts a shared trace
    /// file, if it supports one.
    fn outer_trace_file_env_var(&self) -> Option<&str> {
        None
    }

    /// Runs the tool. Spawns the task's command line by default.
    fn exec(
        &self,
        ctx: &TaskExecutionContext<'_>,
        env: &BTreeMap<String, String>,
    ) -> impl Future<Output = Result<CommandResult, SpawnError>> + Send {
        spawn(*ctx, env.clone())
    }

    /// Whether the traced accesses comply with the declared dependencies.
    fn verify(
        &self,
        ctx: &TaskExecutionContext<'_>,
        trace: Self::Trace,
        settings: &DependencySettings,
    ) -> anyhow::Result<bool>;
}

/// Runs the task through `adapter`, reporting any pipeline error as a task
/// failure.
pub async fn perform<A: Adapter>(ctx: &TaskExecutionContext<'_>, adapter: &A) -> Execution {
    match run_with_verification(ctx, adapter).await {
        Ok(execution) => execution,
        Err(err) => {
            ctx.error(&err);
            Execution::failed()
        }
    }
}

/// Runs the task's command and, when its payload asks for it, verifies the
/// produced trace against the declared dependencies.
pub async fn run_with_verification<A: Adapter>(
    ctx: &TaskExecutionContext<'_>,
    adapter: &A,
) -> Result<Execution, PipelineError> {
    let id = ctx.task.identifier();
    let mut env: BTreeMap<String, String> = ctx
        .task
        .environment()
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();

    let settings = ctx
        .task
        .payload()
        .dependency_settings
        .as_ref()
        .filter(|settings| settings.dependency_settings.verification);

    let Some(settings) = settings else {
        tracing::debug!(%id, phase = ?Phase::Executing, "running without verification");
        let result = adapter.exec(ctx, &env).await?;
        return Ok(Execution::executed(result));
    };

    // the tool resolves relative paths against its own working directory
    let working_directory = ctx.task.working_directory();
    let trace_file = working_directory.join(&settings.trace_file);

    trace::remove_stale(ctx.fs, &trace_file)?;

    let outer_trace_file = adapter
        .outer_trace_file_env_var()
        .and_then(|var| env.remove(var))
        .map(|path| working_directory.join(path));

    tracing::debug!(%id, phase = ?Phase::Executing, trace = %trace_file);
    let result = adapter.exec(ctx, &env).await?;

    if result != CommandResult::Succeeded {
        tracing::debug!(%id, phase = ?Phase::Failed, "skipping verification");
        return Ok(Execution::executed(result));
    }

    let trace: A::Trace =
        trace::read_and_maybe_merge(ctx.fs, &trace_file, outer_trace_file.as_deref())?;

    if adapter.verify(ctx, trace, &settings.dependency_settings)? {
        tracing::info!(%id, "dependencies verified");
        Ok(Execution {
            result,
            phase: Phase::Verified,
        })
    } else {
        tracing::warn!(%id, "dependency verification failed");
        Ok(Execution {
            result: CommandResult::Failed,
            phase: Phase::VerificationFailed,
        })
    }
}

/// Accessed files grouped by the dependency they could not be matched to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndeclaredDependencies {
    pub groups: BTreeMap<String, Vec<Utf8PathBuf>>,
}

impl Display for UndeclaredDependencies {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Undeclared dependencies: ")?;
        for (name, files) in &self.groups {
            write!(f, "\n  {name}")?;
            for file in files {
                write!(f, "\n    - {file}")?;
            }
        }
        Ok(())
    }
}

/// Accessed files without an inferable logical dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmappedAccesses {
    pub files: Vec<Utf8PathBuf>,
}

impl Display for UnmappedAccesses {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Could not infer logical dependency for: ")?;
        for (i, file) in self.files.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{file}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessReport {
    pub undeclared: Option<UndeclaredDependencies>,
    pub unmapped: Option<UnmappedAccesses>,
}

/// Sorts accessed files into undeclared and unmapped ones.
pub fn classify_accesses<I, P>(files: I, settings: &DependencySettings) -> AccessReport
where
    I: IntoIterator<Item = P>,
    P: AsRef<Utf8Path>,
{
    let mut seen = HashSet::new();
    let mut groups: BTreeMap<String, Vec<Utf8PathBuf>> = BTreeMap::new();

    for file in files {
        let file = file.as_ref();
        if !seen.insert(file.to_path_buf()) {
            continue;
        }

        // files with no inferable name land under the empty name
        let name = infer_dependency_name(file).unwrap_or_default();
        groups.entry(name).or_default().push(file.to_path_buf());
    }

    let unmapped = groups
        .remove("")
        .map(|files| UnmappedAccesses { files });

    groups.retain(|name, _| !settings.declares(name));

    let undeclared = if groups.is_empty() {
        None
    } else {
        Some(UndeclaredDependencies { groups })
    };

    AccessReport {
        undeclared,
        unmapped,
    }
}

/// Reports undeclared and unmapped accesses on `ctx` and returns whether
/// the task complied with its declared dependencies.
pub fn verify_files<I, P>(
    ctx: &TaskExecutionContext<'_>,
    files: I,
    settings: &DependencySettings,
) -> bool
where
    I: IntoIterator<Item = P>,
    P: AsRef<Utf8Path>,
{
    let report = classify_accesses(files, settings);

    if let Some(unmapped) = &report.unmapped {
        ctx.warning(unmapped);
    }

    match &report.undeclared {
        Some(undeclared) => {
            ctx.error(undeclared);
            false
        }
        None => true,
    }
}

#[cfg(unix)]
fn os_string(bytes: &[u8]) -> OsString {
    use std::os::unix::ffi::OsStrExt;
    std::ffi::OsStr::from_bytes(bytes).to_os_string()
}

#[cfg(not(unix))]
fn os_string(bytes: &[u8]) -> OsString {
    String::from_utf8_lossy(bytes).into_owned().into()
}

/// Spawns the task's command line with exactly `env` as its environment.
///
/// The child is killed if the returned future is dropped before it exits.
pub async fn spawn(
    ctx: TaskExecutionContext<'_>,
    env: BTreeMap<String, String>,
) -> Result<CommandResult, SpawnError> {
    let (program, args) = ctx
        .task
        .command_line()
        .split_first()
        .ok_or(SpawnError::EmptyCommandLine)?;
    let name = String::from_utf8_lossy(program).into_owned();

    let child = tokio::process::Command::new(os_string(program))
        .args(args.iter().map(|arg| os_string(arg)))
        .env_clear()
        .envs(env)
        .current_dir(ctx.task.working_directory())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SpawnError::Launch {
            program: name.clone(),
            source,
        })?;

    let output = child
        .wait_with_output()
        .await
        .map_err(|source| SpawnError::Wait {
            program: name.clone(),
            source,
        })?;

    for stream in [&output.stdout, &output.stderr] {
        let text = String::from_utf8_lossy(stream);
        let text = text.trim_end();
        if !text.is_empty() {
            ctx.note(text);
        }
    }

    tracing::debug!(program = %name, status = %output.status, "command finished");

    if output.status.success() {
        Ok(CommandResult::Succeeded)
    } else {
        ctx.error(format_args!("Command '{name}' failed with {}", output.status));
        Ok(CommandResult::Failed)
    }
}

mod diagnostics;

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use console::Style;
use indicatif::ProgressStyle;
use indicatif::style::TemplateError;
use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, Level};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::action::TaskAction;
use crate::error::TaskguardError;
use crate::fs::{FileSystem, LocalFs};
use crate::output::{Diagnostic, OutputDelegate, Severity, TaskOutput};
use crate::sandbox::{self, HostLogStore, LogStore};
use crate::store::TaskStore;
use crate::task::{Task, TaskIdentifier};
use crate::verify::{CommandResult, Phase, TaskExecutionContext};

pub use diagnostics::Diagnostics;

const ANSI_BLUE: Style = Style::new().blue();

pub fn as_overhead(s: Instant) -> impl Display {
    let f = format!("(+{}ms)", s.elapsed().as_millis());
    ANSI_BLUE.apply_to(f)
}

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
    pub result: CommandResult,
    pub phase: Phase,
}

/// Settings of an [`Executor`].
#[derive(Clone)]
pub struct ExecutorConfig {
    concurrency: usize,
    sandbox_executable: Utf8PathBuf,
    extract_sandbox_violations: bool,
    log_store: Arc<dyn LogStore>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism().map_or(1, usize::from),
            sandbox_executable: Utf8PathBuf::from(sandbox::SANDBOX_EXECUTABLE),
            extract_sandbox_violations: true,
            log_store: Arc::new(HostLogStore),
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upper bound on tasks running at the same time. At least one.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn sandbox_executable(mut self, path: impl AsRef<Utf8Path>) -> Self {
        self.sandbox_executable = path.as_ref().to_path_buf();
        self
    }

    /// Whether failed sandboxed tasks are followed by a system log query.
    pub fn extract_sandbox_violations(mut self, enabled: bool) -> Self {
        self.extract_sandbox_violations = enabled;
        self
    }

    pub fn log_store(mut self, store: Arc<dyn LogStore>) -> Self {
        self.log_store = store;
        self
    }
}

impl std::fmt::Debug for ExecutorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorConfig")
            .field("concurrency", &self.concurrency)
            .field("sandbox_executable", &self.sandbox_executable)
            .field("extract_sandbox_violations", &self.extract_sandbox_violations)
            .finish_non_exhaustive()
    }
}

/// What one task left behind.
struct TaskReport {
    execution: TaskExecution,
    diagnostics: Vec<Diagnostic>,
    violations: Vec<String>,
}

/// Runs stored tasks concurrently, in no particular order.
pub struct Executor {
    config: ExecutorConfig,
    fs: Arc<dyn FileSystem>,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            fs: Arc::new(LocalFs),
        }
    }

    pub fn with_fs(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Runs the tasks named by `ids` and collects their outcomes.
    ///
    /// A task failing does not stop the others. Every identifier must be
    /// present in `store`.
    pub async fn run(
        &self,
        store: &TaskStore,
        ids: &[TaskIdentifier],
    ) -> Result<Diagnostics, TaskguardError> {
        let tasks = ids
            .iter()
            .map(|id| {
                store
                    .lookup_shared(id)
                    .ok_or_else(|| TaskguardError::TaskNotFound(id.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if tasks.is_empty() {
            return Ok(Diagnostics::default());
        }

        let s = Instant::now();
        let (bar_style, task_style) = styles()?;

        let root_span = tracing::span!(Level::INFO, "running_tasks");
        root_span.pb_set_length(tasks.len() as u64);
        root_span.pb_set_style(&bar_style);
        root_span.pb_set_message("Running tasks...");

        let mut diagnostics = Diagnostics::default();
        let mut running: JoinSet<TaskReport> = JoinSet::new();
        let mut names = HashMap::new();

        for task in tasks {
            while running.len() >= self.config.concurrency {
                self.collect(&mut running, &mut names, &mut diagnostics, &root_span)
                    .await;
            }

            let id = task.identifier().clone();

            let span = tracing::span!(parent: &root_span, Level::INFO, "task", id = %id);
            span.pb_set_style(&task_style);
            span.pb_set_message(&format!("Running {id}"));

            let handle = running.spawn(
                run_task(task, Arc::clone(&self.fs), self.config.clone()).instrument(span),
            );
            names.insert(handle.id(), id);
        }

        while !running.is_empty() {
            self.collect(&mut running, &mut names, &mut diagnostics, &root_span)
                .await;
        }

        tracing::info!(
            "Ran {} tasks, {} failed {}",
            diagnostics.execution_times.len(),
            diagnostics.failed().count(),
            as_overhead(s)
        );

        Ok(diagnostics)
    }

    async fn collect(
        &self,
        running: &mut JoinSet<TaskReport>,
        names: &mut HashMap<tokio::task::Id, TaskIdentifier>,
        diagnostics: &mut Diagnostics,
        root_span: &tracing::Span,
    ) {
        let Some(joined) = running.join_next_with_id().await else {
            return;
        };

        root_span.pb_inc(1);

        match joined {
            Ok((task_id, report)) => {
                let Some(id) = names.remove(&task_id) else {
                    return;
                };
                diagnostics.record(id, report.execution, report.diagnostics, report.violations);
            }
            Err(err) => {
                let Some(id) = names.remove(&err.id()) else {
                    return;
                };

                let (result, message) = join_failure(err);
                tracing::error!(%id, "{message}");
                diagnostics.record(
                    id,
                    TaskExecution {
                        start: Instant::now(),
                        duration: Duration::ZERO,
                        result,
                        phase: Phase::Failed,
                    },
                    vec![Diagnostic {
                        severity: Severity::Error,
                        message,
                    }],
                    Vec::new(),
                );
            }
        }
    }
}

/// How a task that never produced a report ended.
fn join_failure(err: JoinError) -> (CommandResult, String) {
    if !err.is_panic() {
        return (CommandResult::Cancelled, String::from("Task was cancelled"));
    }

    let panic = err.into_panic();
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    };

    (CommandResult::Failed, message)
}

async fn run_task(task: Arc<Task>, fs: Arc<dyn FileSystem>, config: ExecutorConfig) -> TaskReport {
    let output = TaskOutput::new();
    let started_at = Utc::now();
    let start = Instant::now();

    let execution = {
        let ctx = TaskExecutionContext::new(&task, fs.as_ref(), &output);
        match task.action() {
            Some(action) => action.perform(&ctx).await,
            None => TaskAction::Process.perform(&ctx).await,
        }
    };

    let duration = start.elapsed();

    let mut violations = Vec::new();
    if execution.result != CommandResult::Succeeded
        && config.extract_sandbox_violations
        && sandbox::launched_through(&task, config.sandbox_executable.as_str())
    {
        match sandbox::extract_violations_off_runtime(
            Task::clone(&task),
            started_at,
            config.log_store,
        )
        .await
        {
            Ok(found) => {
                for violation in &found {
                    output.error(violation);
                }
                violations = found;
            }
            Err(err) => output.warning(err),
        }
    }

    TaskReport {
        execution: TaskExecution {
            start,
            duration,
            result: execution.result,
            phase: execution.phase,
        },
        diagnostics: output.into_diagnostics(),
        violations,
    }
}

fn styles() -> Result<(ProgressStyle, ProgressStyle), TemplateError> {
    let bar = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
        .progress_chars("=>-");
    let task = ProgressStyle::default_spinner().template("{spinner:.blue} {msg}")?;

    Ok((bar, task))
}

//! Extraction of sandbox denials from the host's system log.
//!
//! Tasks run under `sandbox-exec` carry a per-task sentinel in their sandbox
//! profile. Every denial the sandbox logs on their behalf mentions that
//! sentinel, so after a failed run the log can be searched for the
//! violations belonging to exactly that task.
//!
//! Querying the log blocks, and the system log client waits on work of its
//! own. [`extract_violations`] therefore refuses to run on a thread that is
//! driving an async runtime, [`extract_violations_off_runtime`] moves the
//! query onto a dedicated thread.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::error::SandboxError;
use crate::task::Task;

/// Executable through which sandboxed tasks are launched.
pub const SANDBOX_EXECUTABLE: &str = "/usr/bin/sandbox-exec";

pub const SANDBOX_REPORTING_SUBSYSTEM: &str = "com.apple.sandbox.reporting";

/// Returned instead of violations on hosts without a queryable system log.
pub const UNAVAILABLE_PLACEHOLDER: &str = "Cannot obtain list of violations on non-macOS platforms";

/// Whether the task is launched through the sandbox executable.
///
/// Also true for sandboxed tasks whose profile carries no sentinel, for
/// which no violations will ever be found.
pub fn is_sandboxed(task: &Task) -> bool {
    launched_through(task, SANDBOX_EXECUTABLE)
}

/// Whether the first element of the task's command line is `executable`.
pub fn launched_through(task: &Task, executable: &str) -> bool {
    task.command_line()
        .first()
        .is_some_and(|program| &**program == executable.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentCategory {
    String,
    Scalar,
    Data,
    Undefined,
}

/// One formatted argument of a log entry's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogComponent {
    pub category: ArgumentCategory,
    pub string_value: Option<String>,
}

impl LogComponent {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            category: ArgumentCategory::String,
            string_value: Some(value.into()),
        }
    }
}

/// A system log entry, reduced to what violation extraction looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub process_id: u32,
    pub process: String,
    pub sender_image_path: String,
    pub subsystem: Option<String>,
    pub message: String,
    /// Formatted payload arguments, when the log facility exposes them.
    pub components: Option<Vec<LogComponent>>,
}

/// Which sandbox log entries belong to one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLogFilter {
    sentinel: String,
}

impl SandboxLogFilter {
    pub fn new(sentinel: impl Into<String>) -> Self {
        Self {
            sentinel: sentinel.into(),
        }
    }

    pub fn for_task(task: &Task) -> Self {
        Self::new(task.identifier().sandbox_profile_sentinel())
    }

    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    /// The filter as a system log predicate.
    pub fn predicate(&self) -> String {
        let sentinel = self.sentinel.replace('\\', "\\\\").replace('"', "\\\"");
        format!(
            r#"((processID == 0 AND senderImagePath CONTAINS[c] "/Sandbox") OR (process == "sandboxd" AND subsystem == "{SANDBOX_REPORTING_SUBSYSTEM}")) AND (eventMessage CONTAINS[c] "{sentinel}")"#
        )
    }

    pub fn matches(&self, entry: &LogEntry) -> bool {
        let from_kernel =
            entry.process_id == 0 && contains_ignore_case(&entry.sender_image_path, "/Sandbox");
        let from_daemon = entry.process == "sandboxd"
            && entry.subsystem.as_deref() == Some(SANDBOX_REPORTING_SUBSYSTEM);

        (from_kernel || from_daemon) && contains_ignore_case(&entry.message, &self.sentinel)
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// A query over the system log, covering `[since, until)`.
#[derive(Debug, Clone, Copy)]
pub struct LogQuery<'a> {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub filter: &'a SandboxLogFilter,
}

impl LogQuery<'_> {
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.since <= at && at < self.until
    }
}

/// Access to the host's structured system log.
pub trait LogStore: Send + Sync {
    /// Entries matching `query`, oldest first, or `None` when the host has
    /// no queryable log. May block.
    fn entries(&self, query: &LogQuery<'_>) -> anyhow::Result<Option<Vec<LogEntry>>>;
}

/// Collects the sandbox violations logged for `task` since `start`.
///
/// Blocks on the log query. Fails with [`SandboxError::InsideRuntime`] when
/// called from a thread driving a Tokio runtime.
pub fn extract_violations(
    task: &Task,
    start: DateTime<Utc>,
    store: &dyn LogStore,
) -> Result<Vec<String>, SandboxError> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(SandboxError::InsideRuntime);
    }

    let filter = SandboxLogFilter::for_task(task);
    let query = LogQuery {
        since: start,
        until: Utc::now(),
        filter: &filter,
    };

    let Some(entries) = store.entries(&query)? else {
        return Ok(vec![UNAVAILABLE_PLACEHOLDER.to_string()]);
    };

    let mut violations = Vec::new();
    let relevant = entries
        .iter()
        .filter(|entry| query.covers(entry.timestamp) && filter.matches(entry));

    for entry in relevant {
        // the remaining lines repeat the profile sentinel
        let first_line = entry.message.lines().next().unwrap_or_default();
        violations.push(first_line.to_string());

        if let Some(components) = &entry.components
            && components.len() >= 5
            && components[3].category == ArgumentCategory::String
            && let Some(detail) = &components[3].string_value
        {
            violations.push(detail.clone());
        }
    }

    tracing::debug!(id = %task.identifier(), count = violations.len(), "extracted sandbox violations");

    Ok(violations)
}

/// Runs [`extract_violations`] on a dedicated thread and waits for it
/// without blocking the runtime.
pub async fn extract_violations_off_runtime(
    task: Task,
    start: DateTime<Utc>,
    store: Arc<dyn LogStore>,
) -> Result<Vec<String>, SandboxError> {
    let (tx, rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("sandbox-log".into())
        .spawn(move || {
            let _ = tx.send(extract_violations(&task, start, store.as_ref()));
        })
        .map_err(|_| SandboxError::Thread)?;

    rx.await.map_err(|_| SandboxError::Thread)?
}

/// The host's system log.
///
/// On macOS this shells out to `log show`. Elsewhere there is nothing to
/// query and every lookup yields `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostLogStore;

#[cfg(not(target_os = "macos"))]
impl LogStore for HostLogStore {
    fn entries(&self, _: &LogQuery<'_>) -> anyhow::Result<Option<Vec<LogEntry>>> {
        Ok(None)
    }
}

#[cfg(target_os = "macos")]
impl LogStore for HostLogStore {
    fn entries(&self, query: &LogQuery<'_>) -> anyhow::Result<Option<Vec<LogEntry>>> {
        macos::show(query).map(Some)
    }
}

#[cfg(target_os = "macos")]
mod macos {
    use std::process::Command;

    use anyhow::{Context, bail};
    use camino::Utf8Path;
    use chrono::{DateTime, Local, Utc};
    use serde::Deserialize;

    use super::{LogEntry, LogQuery};

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Record {
        event_message: Option<String>,
        #[serde(rename = "processID", default)]
        process_id: u32,
        #[serde(default)]
        process_image_path: String,
        #[serde(default)]
        sender_image_path: String,
        subsystem: Option<String>,
        timestamp: Option<String>,
    }

    pub(super) fn show(query: &LogQuery<'_>) -> anyhow::Result<Vec<LogEntry>> {
        let start = query.since.with_timezone(&Local);
        let end = query.until.with_timezone(&Local);

        let output = Command::new("/usr/bin/log")
            .arg("show")
            .args(["--style", "ndjson"])
            .args(["--start", &start.format("%Y-%m-%d %H:%M:%S").to_string()])
            .args(["--end", &end.format("%Y-%m-%d %H:%M:%S%.f").to_string()])
            .args(["--predicate", &query.filter.predicate()])
            .output()
            .context("Couldn't run `log show`")?;

        if !output.status.success() {
            bail!(
                "`log show` failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let mut entries = Vec::new();
        for line in output.stdout.split(|&b| b == b'\n') {
            // the trailing summary record has no message
            let Ok(record) = serde_json::from_slice::<Record>(line) else {
                continue;
            };
            let Some(message) = record.event_message else {
                continue;
            };

            let process = Utf8Path::new(&record.process_image_path)
                .file_name()
                .unwrap_or_default()
                .to_string();
            let timestamp = record
                .timestamp
                .as_deref()
                .and_then(|ts| DateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S%.f%z").ok())
                .map(|ts| ts.with_timezone(&Utc))
                .unwrap_or(query.since);

            entries.push(LogEntry {
                timestamp,
                process_id: record.process_id,
                process,
                sender_image_path: record.sender_image_path,
                subsystem: record.subsystem,
                message,
                components: None,
            });
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    /// A log held in memory.
    struct MemoryLog(Option<Vec<LogEntry>>);

    impl LogStore for MemoryLog {
        fn entries(&self, query: &LogQuery<'_>) -> anyhow::Result<Option<Vec<LogEntry>>> {
            Ok(self.0.as_ref().map(|entries| {
                entries
                    .iter()
                    .filter(|entry| query.covers(entry.timestamp))
                    .cloned()
                    .collect()
            }))
        }
    }

    fn sandboxed_task() -> Task {
        Task::builder("compile a.c")
            .args([SANDBOX_EXECUTABLE, "-p", "(version 1)", "/usr/bin/clang"])
            .build()
    }

    fn kernel_entry(message: String, at: DateTime<Utc>) -> LogEntry {
        LogEntry {
            timestamp: at,
            process_id: 0,
            process: "kernel".into(),
            sender_image_path: "/System/Library/Extensions/Sandbox.kext/Contents/MacOS/Sandbox"
                .into(),
            subsystem: None,
            message,
            components: None,
        }
    }

    fn daemon_entry(message: String, at: DateTime<Utc>) -> LogEntry {
        LogEntry {
            timestamp: at,
            process_id: 140,
            process: "sandboxd".into(),
            sender_image_path: "/usr/libexec/sandboxd".into(),
            subsystem: Some(SANDBOX_REPORTING_SUBSYSTEM.into()),
            message,
            components: None,
        }
    }

    #[test]
    fn test_is_sandboxed() {
        assert!(is_sandboxed(&sandboxed_task()));
        assert!(!is_sandboxed(&Task::builder("t").arg("/usr/bin/clang").build()));
        assert!(!is_sandboxed(&Task::builder("t").build()));
    }

    #[test]
    fn test_predicate_names_sentinel() {
        let filter = SandboxLogFilter::new("abc123");
        let predicate = filter.predicate();
        assert!(predicate.starts_with(r#"((processID == 0 AND senderImagePath CONTAINS[c] "/Sandbox")"#));
        assert!(predicate.ends_with(r#"AND (eventMessage CONTAINS[c] "abc123")"#));
    }

    #[test]
    fn test_filter() {
        let now = Utc::now();
        let filter = SandboxLogFilter::new("ABC");

        assert!(filter.matches(&kernel_entry("deny abc".into(), now)));
        assert!(filter.matches(&daemon_entry("deny ABC".into(), now)));
        assert!(!filter.matches(&kernel_entry("deny xyz".into(), now)));

        let mut foreign = daemon_entry("deny ABC".into(), now);
        foreign.subsystem = Some("com.example".into());
        assert!(!filter.matches(&foreign));

        let mut user_process = kernel_entry("deny ABC".into(), now);
        user_process.process_id = 42;
        assert!(!filter.matches(&user_process));
    }

    #[test]
    fn test_extracts_first_lines_in_order() {
        let task = sandboxed_task();
        let sentinel = task.identifier().sandbox_profile_sentinel();
        let start = Utc::now() - TimeDelta::seconds(1);
        let later = start + TimeDelta::milliseconds(5);

        let log = MemoryLog(Some(vec![
            kernel_entry(format!("deny(1) file-read-data /etc/secret\n{sentinel}"), later),
            kernel_entry("deny(1) file-read-data /other".into(), later),
            daemon_entry(format!("deny(1) file-write-create /tmp/x\n{sentinel}"), later),
            kernel_entry(format!("too early\n{sentinel}"), start - TimeDelta::seconds(1)),
        ]));

        let violations = extract_violations(&task, start, &log).unwrap();
        assert_eq!(
            violations,
            [
                "deny(1) file-read-data /etc/secret",
                "deny(1) file-write-create /tmp/x"
            ]
        );
    }

    #[test]
    fn test_window_ends_at_query_time() {
        let task = sandboxed_task();
        let sentinel = task.identifier().sandbox_profile_sentinel();
        let start = Utc::now() - TimeDelta::seconds(1);

        // a store that ignores the window entirely
        struct Unbounded(Vec<LogEntry>);

        impl LogStore for Unbounded {
            fn entries(&self, query: &LogQuery<'_>) -> anyhow::Result<Option<Vec<LogEntry>>> {
                assert!(query.since <= query.until);
                Ok(Some(self.0.clone()))
            }
        }

        let log = Unbounded(vec![
            daemon_entry(format!("deny now\n{sentinel}"), start),
            daemon_entry(format!("deny later\n{sentinel}"), start + TimeDelta::hours(1)),
            daemon_entry(format!("deny before\n{sentinel}"), start - TimeDelta::hours(1)),
        ]);

        let violations = extract_violations(&task, start, &log).unwrap();
        assert_eq!(violations, ["deny now"]);
    }

    #[test]
    fn test_query_window_is_half_open() {
        let filter = SandboxLogFilter::new("x");
        let since = Utc::now();
        let until = since + TimeDelta::seconds(1);
        let query = LogQuery {
            since,
            until,
            filter: &filter,
        };

        assert!(query.covers(since));
        assert!(!query.covers(until));
        assert!(!query.covers(since - TimeDelta::milliseconds(1)));
    }

    #[test]
    fn test_payload_detail_is_appended() {
        let task = sandboxed_task();
        let sentinel = task.identifier().sandbox_profile_sentinel();
        let start = Utc::now() - TimeDelta::seconds(1);

        let scalar = LogComponent {
            category: ArgumentCategory::Scalar,
            string_value: None,
        };

        let mut detailed = kernel_entry(format!("deny file-read-data\n{sentinel}"), start);
        detailed.components = Some(vec![
            scalar.clone(),
            scalar.clone(),
            scalar.clone(),
            LogComponent::string("clang(123) deny(1) file-read-data /etc/secret"),
            scalar.clone(),
        ]);

        let mut short = kernel_entry(format!("deny short\n{sentinel}"), start);
        short.components = Some(vec![LogComponent::string("ignored")]);

        let mut wrong_category = kernel_entry(format!("deny data\n{sentinel}"), start);
        wrong_category.components = Some(vec![scalar.clone(); 5]);

        let log = MemoryLog(Some(vec![detailed, short, wrong_category]));
        let violations = extract_violations(&task, start, &log).unwrap();

        assert_eq!(
            violations,
            [
                "deny file-read-data",
                "clang(123) deny(1) file-read-data /etc/secret",
                "deny short",
                "deny data"
            ]
        );
    }

    #[test]
    fn test_unavailable_log_yields_placeholder() {
        let violations =
            extract_violations(&sandboxed_task(), Utc::now(), &MemoryLog(None)).unwrap();
        assert_eq!(violations, [UNAVAILABLE_PLACEHOLDER]);
    }

    #[tokio::test]
    async fn test_refuses_runtime_thread() {
        let err = extract_violations(&sandboxed_task(), Utc::now(), &MemoryLog(Some(vec![])))
            .unwrap_err();
        assert!(matches!(err, SandboxError::InsideRuntime));
    }

    #[tokio::test]
    async fn test_off_runtime() {
        let task = sandboxed_task();
        let sentinel = task.identifier().sandbox_profile_sentinel();
        let start = Utc::now() - TimeDelta::seconds(1);
        let log = Arc::new(MemoryLog(Some(vec![daemon_entry(
            format!("deny network-outbound\n{sentinel}"),
            start,
        )])));

        let violations = extract_violations_off_runtime(task, start, log).await.unwrap();
        assert_eq!(violations, ["deny network-outbound"]);
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_host_log_is_unavailable() {
        let violations = extract_violations(&sandboxed_task(), Utc::now(), &HostLogStore).unwrap();
        assert_eq!(violations, [UNAVAILABLE_PLACEHOLDER]);
    }
}

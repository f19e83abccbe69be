use std::collections::HashMap;
use std::fmt::Write;

use crate::executor::TaskExecution;
use crate::output::{Diagnostic, Severity};
use crate::task::TaskIdentifier;
use crate::verify::{CommandResult, Phase};

/// Outcome of an [`Executor::run`](crate::executor::Executor::run).
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Timing and verdict of every task that ran.
    pub execution_times: HashMap<TaskIdentifier, TaskExecution>,
    /// Messages each task reported, in emission order.
    pub messages: HashMap<TaskIdentifier, Vec<Diagnostic>>,
    /// Sandbox denials found for failed sandboxed tasks.
    pub sandbox_violations: HashMap<TaskIdentifier, Vec<String>>,
}

impl Diagnostics {
    pub(crate) fn record(
        &mut self,
        id: TaskIdentifier,
        execution: TaskExecution,
        messages: Vec<Diagnostic>,
        violations: Vec<String>,
    ) {
        if !violations.is_empty() {
            self.sandbox_violations.insert(id.clone(), violations);
        }
        if !messages.is_empty() {
            self.messages.insert(id.clone(), messages);
        }
        self.execution_times.insert(id, execution);
    }

    /// Tasks that did not succeed, sorted by identifier.
    pub fn failed(&self) -> impl Iterator<Item = &TaskIdentifier> {
        let mut failed: Vec<_> = self
            .execution_times
            .iter()
            .filter(|(_, execution)| execution.result != CommandResult::Succeeded)
            .map(|(id, _)| id)
            .collect();
        failed.sort();
        failed.into_iter()
    }

    pub fn succeeded(&self) -> bool {
        self.failed().next().is_none()
    }

    /// Number of reported messages of the given severity, across all tasks.
    pub fn count(&self, severity: Severity) -> usize {
        self.messages
            .values()
            .flatten()
            .filter(|diagnostic| diagnostic.severity == severity)
            .count()
    }

    /// Plain-text report of the run, one block per task in start order.
    pub fn render_report(&self) -> String {
        let mut ran: Vec<_> = self.execution_times.iter().collect();
        if ran.is_empty() {
            return String::from("No tasks ran\n");
        }
        ran.sort_by_key(|(_, execution)| execution.start);

        let width = ran.iter().map(|(id, _)| id.as_str().len()).max().unwrap_or(0);

        let mut out = String::new();
        for (id, execution) in ran {
            let _ = writeln!(
                out,
                "{:<width$}  {:<18}  {}",
                id.as_str(),
                phase_label(execution.phase),
                format_duration(execution.duration.as_micros() as f64),
            );

            for diagnostic in self.messages.get(id).into_iter().flatten() {
                for line in diagnostic.to_string().lines() {
                    let _ = writeln!(out, "    {line}");
                }
            }
        }

        out
    }
}

fn phase_label(phase: Phase) -> &'static str {
    match phase {
        Phase::NotStarted => "not started",
        Phase::Executing => "executing",
        Phase::Succeeded => "succeeded",
        Phase::Failed => "failed",
        Phase::Verified => "verified",
        Phase::VerificationFailed => "verification failed",
    }
}

fn format_duration(micros: f64) -> String {
    if micros < 1000.0 {
        format!("{micros:.0}µs")
    } else {
        format!("{:.2}ms", micros / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn execution(start: Instant, millis: u64, phase: Phase) -> TaskExecution {
        let result = match phase {
            Phase::Succeeded | Phase::Verified => CommandResult::Succeeded,
            _ => CommandResult::Failed,
        };
        TaskExecution {
            start,
            duration: Duration::from_millis(millis),
            result,
            phase,
        }
    }

    #[test]
    fn test_report() {
        let now = Instant::now();
        let mut diagnostics = Diagnostics::default();

        diagnostics.record(
            TaskIdentifier::new("link"),
            execution(now + Duration::from_millis(5), 3, Phase::VerificationFailed),
            vec![Diagnostic {
                severity: Severity::Error,
                message: "Undeclared dependencies: \n  Baz\n    - /x/libBaz.a".into(),
            }],
            Vec::new(),
        );
        diagnostics.record(
            TaskIdentifier::new("cc"),
            execution(now, 2, Phase::Succeeded),
            Vec::new(),
            Vec::new(),
        );

        assert!(!diagnostics.succeeded());
        assert_eq!(diagnostics.count(Severity::Error), 1);
        assert!(!diagnostics.messages.contains_key(&TaskIdentifier::new("cc")));

        let report = diagnostics.render_report();
        let lines: Vec<_> = report.lines().collect();
        assert_eq!(lines[0], "cc    succeeded           2.00ms");
        assert_eq!(lines[1], "link  verification failed  3.00ms");
        assert_eq!(lines[2], "    error: Undeclared dependencies: ");
        assert_eq!(lines[4], "        - /x/libBaz.a");
    }

    #[test]
    fn test_empty_report() {
        assert_eq!(Diagnostics::default().render_report(), "No tasks ran\n");
        assert!(Diagnostics::default().succeeded());
    }
}

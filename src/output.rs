use std::fmt::{Display, Formatter};
use std::sync::{Mutex, PoisonError};

/// How bad a reported diagnostic is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Note,
    Warning,
    Error,
}

/// A single user-facing message attributed to one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self.severity {
            Severity::Note => "note",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{label}: {}", self.message)
    }
}

/// Receives the diagnostics a task produces while it runs.
pub trait OutputDelegate: Send + Sync {
    fn emit(&self, diagnostic: Diagnostic);

    fn error(&self, message: impl Display)
    where
        Self: Sized,
    {
        self.emit(Diagnostic {
            severity: Severity::Error,
            message: message.to_string(),
        });
    }

    fn warning(&self, message: impl Display)
    where
        Self: Sized,
    {
        self.emit(Diagnostic {
            severity: Severity::Warning,
            message: message.to_string(),
        });
    }

    fn note(&self, message: impl Display)
    where
        Self: Sized,
    {
        self.emit(Diagnostic {
            severity: Severity::Note,
            message: message.to_string(),
        });
    }
}

/// Collects a task's diagnostics and mirrors them to the log.
#[derive(Debug, Default)]
pub struct TaskOutput {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl TaskOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        self.diagnostics
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|diagnostic| diagnostic.severity == severity)
            .count()
    }
}

impl OutputDelegate for TaskOutput {
    fn emit(&self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Note => tracing::info!("{}", diagnostic.message),
            Severity::Warning => tracing::warn!("{}", diagnostic.message),
            Severity::Error => tracing::error!("{}", diagnostic.message),
        }

        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collects_in_order() {
        let output = TaskOutput::new();
        output.warning("first");
        output.error(format_args!("second {}", 2));

        assert_eq!(output.count(Severity::Warning), 1);
        assert_eq!(output.count(Severity::Error), 1);

        let rendered: Vec<_> = output
            .into_diagnostics()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(rendered, ["warning: first", "error: second 2"]);
    }
}

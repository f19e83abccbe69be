use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::verify::{
    AccessTraceAdapter, Execution, LdAdapter, TaskExecutionContext, perform, spawn,
};

/// How a stored task is carried out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TaskAction {
    /// Runs the command line as is, without any trace.
    Process,
    /// Runs the linker and verifies the libraries it loaded.
    Linker,
    /// Runs a tool that writes a generic file access trace.
    AccessTrace {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outer_trace_env: Option<String>,
    },
}

impl TaskAction {
    pub async fn perform(&self, ctx: &TaskExecutionContext<'_>) -> Execution {
        match self {
            TaskAction::Process => {
                if let Some(settings) = &ctx.task.payload().dependency_settings
                    && settings.dependency_settings.verification
                {
                    ctx.warning(format_args!(
                        "Dependency verification requested for '{}', but its action writes no trace; accesses were not verified",
                        ctx.task.identifier()
                    ));
                }

                let env: BTreeMap<String, String> = ctx
                    .task
                    .environment()
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect();

                match spawn(*ctx, env).await {
                    Ok(result) => Execution::executed(result),
                    Err(err) => {
                        ctx.error(&err);
                        Execution::failed()
                    }
                }
            }
            TaskAction::Linker => perform(ctx, &LdAdapter).await,
            TaskAction::AccessTrace { outer_trace_env } => {
                let adapter = match outer_trace_env {
                    Some(var) => AccessTraceAdapter::with_outer_trace_env(var),
                    None => AccessTraceAdapter::new(),
                };
                perform(ctx, &adapter).await
            }
        }
    }
}

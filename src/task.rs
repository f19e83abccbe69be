use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::action::TaskAction;
use crate::core::{ArcBytes, ArcStr, Hash32};
use crate::dependencies::TaskDependencySettings;
use crate::error::StoreError;
use crate::intern::{ByteStringArena, StringArena};

/// Stable, task-kind specific key of a task within a build plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskIdentifier(ArcStr);

impl TaskIdentifier {
    pub fn new(id: impl Into<ArcStr>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Marker embedded in this task's sandbox profile, used to find the
    /// system log entries emitted on its behalf.
    pub fn sandbox_profile_sentinel(&self) -> String {
        Hash32::hash(self.0.as_bytes()).to_hex()
    }
}

impl Display for TaskIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A target configured for one build, which owns a group of tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfiguredTarget {
    guid: ArcStr,
}

impl ConfiguredTarget {
    pub fn new(guid: impl Into<ArcStr>) -> Self {
        Self { guid: guid.into() }
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }
}

/// Opaque per-task-kind data. Only the verification settings are
/// interpreted here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub dependency_settings: Option<TaskDependencySettings>,
}

/// An immutable description of one build action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    identifier: TaskIdentifier,
    command_line: Vec<ArcBytes>,
    environment: BTreeMap<ArcStr, ArcStr>,
    working_directory: ArcStr,
    inputs: Vec<ArcStr>,
    outputs: Vec<ArcStr>,
    for_target: Option<ConfiguredTarget>,
    payload: TaskPayload,
    action: Option<TaskAction>,
}

impl Task {
    pub fn builder(identifier: impl Into<ArcStr>) -> TaskBuilder {
        TaskBuilder::new(identifier)
    }

    pub fn identifier(&self) -> &TaskIdentifier {
        &self.identifier
    }

    pub fn command_line(&self) -> &[ArcBytes] {
        &self.command_line
    }

    /// The command line decoded as UTF-8, lossily.
    pub fn command_line_strings(&self) -> impl Iterator<Item = Cow<'_, str>> {
        self.command_line
            .iter()
            .map(|arg| String::from_utf8_lossy(arg))
    }

    pub fn environment(&self) -> &BTreeMap<ArcStr, ArcStr> {
        &self.environment
    }

    pub fn working_directory(&self) -> &Utf8Path {
        Utf8Path::new(&*self.working_directory)
    }

    pub fn inputs(&self) -> impl Iterator<Item = &Utf8Path> {
        self.inputs.iter().map(|path| Utf8Path::new(&**path))
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Utf8Path> {
        self.outputs.iter().map(|path| Utf8Path::new(&**path))
    }

    pub fn for_target(&self) -> Option<&ConfiguredTarget> {
        self.for_target.as_ref()
    }

    pub fn payload(&self) -> &TaskPayload {
        &self.payload
    }

    pub fn action(&self) -> Option<&TaskAction> {
        self.action.as_ref()
    }

    /// Moves every string of this task into the shared arenas.
    pub(crate) fn intern(
        &mut self,
        strings: &mut StringArena,
        bytes: &mut ByteStringArena,
    ) -> Result<(), StoreError> {
        strings.canonicalize(&mut self.identifier.0)?;

        for arg in &mut self.command_line {
            bytes.canonicalize(arg)?;
        }

        let environment = std::mem::take(&mut self.environment);
        for (mut key, mut value) in environment {
            strings.canonicalize(&mut key)?;
            strings.canonicalize(&mut value)?;
            self.environment.insert(key, value);
        }

        strings.canonicalize(&mut self.working_directory)?;

        for path in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            strings.canonicalize(path)?;
        }

        if let Some(target) = &mut self.for_target {
            strings.canonicalize(&mut target.guid)?;
        }

        Ok(())
    }
}

/// A builder struct for creating a [`Task`].
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    fn new(identifier: impl Into<ArcStr>) -> Self {
        Self {
            task: Task {
                identifier: TaskIdentifier::new(identifier),
                command_line: Vec::new(),
                environment: BTreeMap::new(),
                working_directory: ArcStr::from("."),
                inputs: Vec::new(),
                outputs: Vec::new(),
                for_target: None,
                payload: TaskPayload::default(),
                action: None,
            },
        }
    }

    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.task.command_line.push(ArcBytes::from(arg.as_ref()));
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        self.task
            .command_line
            .extend(args.into_iter().map(|arg| ArcBytes::from(arg.as_ref())));
        self
    }

    pub fn env(mut self, key: impl Into<ArcStr>, value: impl Into<ArcStr>) -> Self {
        self.task.environment.insert(key.into(), value.into());
        self
    }

    pub fn working_directory(mut self, path: impl AsRef<Utf8Path>) -> Self {
        self.task.working_directory = ArcStr::from(path.as_ref().as_str());
        self
    }

    pub fn input(mut self, path: impl AsRef<Utf8Path>) -> Self {
        self.task.inputs.push(ArcStr::from(path.as_ref().as_str()));
        self
    }

    pub fn output(mut self, path: impl AsRef<Utf8Path>) -> Self {
        self.task.outputs.push(ArcStr::from(path.as_ref().as_str()));
        self
    }

    pub fn target(mut self, target: ConfiguredTarget) -> Self {
        self.task.for_target = Some(target);
        self
    }

    pub fn dependency_settings(mut self, settings: TaskDependencySettings) -> Self {
        self.task.payload.dependency_settings = Some(settings);
        self
    }

    pub fn action(mut self, action: TaskAction) -> Self {
        self.task.action = Some(action);
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

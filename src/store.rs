//! The canonical set of tasks of one build plan.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::action::TaskAction;
use crate::error::StoreError;
use crate::intern::{ByteStringArena, StringArena};
use crate::task::{ConfiguredTarget, Task, TaskIdentifier};

type TargetIndex = HashMap<Option<ConfiguredTarget>, Arc<[Arc<Task>]>>;

/// Owns every task of a build plan, keyed by its identifier.
///
/// Construction is single threaded: [`insert`](Self::insert) needs `&mut self`.
/// Once built, the store can be shared by reference between worker threads,
/// all read operations take `&self`.
#[derive(Default)]
pub struct TaskStore {
    tasks: HashMap<TaskIdentifier, Arc<Task>>,
    strings: StringArena,
    bytes: ByteStringArena,
    /// Tasks grouped by target, populated on demand and never persisted.
    tasks_by_target: Mutex<TargetIndex>,
    index_computations: AtomicUsize,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a task under its identifier, interning its strings.
    ///
    /// An identifier already present is a hard error and leaves the existing
    /// task untouched.
    pub fn insert(&mut self, mut task: Task) -> Result<TaskIdentifier, StoreError> {
        if self.tasks.contains_key(task.identifier()) {
            return Err(StoreError::DuplicateIdentifier(task.identifier().clone()));
        }

        task.intern(&mut self.strings, &mut self.bytes)?;

        let id = task.identifier().clone();
        self.tasks.insert(id.clone(), Arc::new(task));

        // &mut self guarantees nobody holds a view of the old index
        self.tasks_by_target
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        Ok(id)
    }

    pub fn lookup(&self, id: &TaskIdentifier) -> Option<&Task> {
        self.tasks.get(id).map(Arc::as_ref)
    }

    /// Like [`lookup`](Self::lookup), but the task can outlive the borrow.
    pub fn lookup_shared(&self, id: &TaskIdentifier) -> Option<Arc<Task>> {
        self.tasks.get(id).cloned()
    }

    pub fn lookup_action(&self, id: &TaskIdentifier) -> Option<&TaskAction> {
        self.lookup(id).and_then(Task::action)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn for_each(&self, mut visit: impl FnMut(&Task)) {
        for task in self.tasks.values() {
            visit(task);
        }
    }

    /// Tasks owned by `target`, sorted by identifier.
    ///
    /// Computed at most once per target, concurrent first callers wait for
    /// the single computation.
    pub fn tasks_for_target(&self, target: Option<&ConfiguredTarget>) -> Arc<[Arc<Task>]> {
        let mut index = self
            .tasks_by_target
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let key = target.cloned();
        if let Some(tasks) = index.get(&key) {
            return Arc::clone(tasks);
        }

        self.index_computations.fetch_add(1, Ordering::Relaxed);

        let mut tasks: Vec<_> = self
            .tasks
            .values()
            .filter(|task| task.for_target() == target)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.identifier().cmp(b.identifier()));

        let tasks: Arc<[Arc<Task>]> = tasks.into();
        index.insert(key, Arc::clone(&tasks));

        tasks
    }

    /// Number of times the target index had to be computed.
    pub fn index_computations(&self) -> usize {
        self.index_computations.load(Ordering::Relaxed)
    }

    /// Stops interning; later inserts fail with [`StoreError::Frozen`].
    pub fn freeze(&mut self) {
        self.strings.freeze();
        self.bytes.freeze();
        tracing::debug!(
            strings = ?self.strings.stats(),
            bytes = ?self.bytes.stats(),
            "froze task store arenas"
        );
    }

    /// Writes the task set as CBOR. Caches are not part of the output.
    pub fn serialize<W: Write>(&self, writer: W) -> Result<(), StoreError> {
        let mut tasks: Vec<&Task> = self.tasks.values().map(Arc::as_ref).collect();
        tasks.sort_by(|a, b| a.identifier().cmp(b.identifier()));

        ciborium::into_writer(&tasks, writer)?;
        Ok(())
    }

    /// Rebuilds a store from [`serialize`](Self::serialize) output,
    /// interning every task again and starting with empty caches.
    pub fn deserialize<R: Read>(reader: R) -> Result<Self, StoreError> {
        let tasks: Vec<Task> = ciborium::from_reader(reader)?;

        let mut store = Self::new();
        for task in tasks {
            store.insert(task)?;
        }

        Ok(store)
    }
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("tasks", &self.tasks.len())
            .field("strings", &self.strings.stats())
            .field("bytes", &self.bytes.stats())
            .finish()
    }
}

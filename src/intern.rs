//! De-duplicating storage for the strings shared between tasks.
//!
//! A build plan contains thousands of tasks whose command lines and
//! environments are mostly identical: the same compiler path, the same
//! `-isysroot`, the same `PATH`. An [`InterningArena`] keeps exactly one
//! allocation per distinct value and hands out either a [`Handle`] or the
//! canonical `Arc` itself. Interning never changes what a value compares equal
//! to, only where it is stored.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::Hash32;
use crate::error::StoreError;

/// Interning arena for UTF-8 strings.
pub type StringArena = InterningArena<str>;

/// Interning arena for raw byte strings.
pub type ByteStringArena = InterningArena<[u8]>;

/// Index of an interned item within the arena that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Number of calls to [`InterningArena::intern`].
    pub calls: usize,
    /// Number of distinct items stored.
    pub items: usize,
}

pub struct InterningArena<T: ?Sized> {
    /// Content hash -> handle. `None` once the arena is frozen.
    uniquer: Option<HashMap<Hash32, Handle>>,
    items: Vec<Arc<T>>,
    calls: usize,
}

impl<T: ?Sized> Default for InterningArena<T> {
    fn default() -> Self {
        Self {
            uniquer: Some(HashMap::new()),
            items: Vec::new(),
            calls: 0,
        }
    }
}

impl<T> InterningArena<T>
where
    T: ?Sized + AsRef<[u8]> + Eq,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle of the stored item equal to `item`, storing it first
    /// if this is the first time the arena sees it.
    pub fn intern(&mut self, item: &Arc<T>) -> Result<Handle, StoreError> {
        let uniquer = self.uniquer.as_mut().ok_or(StoreError::Frozen)?;
        self.calls += 1;

        let hash = Hash32::hash((**item).as_ref());

        if let Some(&handle) = uniquer.get(&hash)
            && *self.items[handle.0 as usize] == **item
        {
            return Ok(handle);
        }

        let index = u32::try_from(self.items.len()).map_err(|_| StoreError::ArenaCapacity)?;
        let handle = Handle(index);
        self.items.push(Arc::clone(item));
        uniquer.entry(hash).or_insert(handle);

        Ok(handle)
    }

    /// Replaces `item` with the arena's canonical allocation of the same value.
    pub fn canonicalize(&mut self, item: &mut Arc<T>) -> Result<(), StoreError> {
        let handle = self.intern(item)?;
        *item = Arc::clone(&self.items[handle.0 as usize]);
        Ok(())
    }

    /// Resolves a handle produced by this arena.
    pub fn lookup(&self, handle: Handle) -> Option<&Arc<T>> {
        self.items.get(handle.0 as usize)
    }

    /// Drops the uniquing table. Handles stay resolvable, further interning
    /// is refused.
    pub fn freeze(&mut self) {
        self.uniquer = None;
    }

    pub fn is_frozen(&self) -> bool {
        self.uniquer.is_none()
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            calls: self.calls,
            items: self.items.len(),
        }
    }
}

use std::fmt::Write;
use std::sync::Arc;

/// Atomic reference-counted string type used for interned task fields.
pub type ArcStr = Arc<str>;

/// Atomic reference-counted byte string, used for command line arguments
/// which are not guaranteed to be valid UTF-8.
pub type ArcBytes = Arc<[u8]>;

/// A 32-byte BLAKE3 hash used for content addressing.
///
/// In `taskguard` this serves two purposes:
/// 1. It keys the interning arenas, so that structurally identical strings
///    across thousands of tasks share one allocation.
/// 2. It derives the per-task sandbox profile sentinel, which correlates
///    host log entries with the task that produced them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn to_hex(self) -> String {
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            // writing into a String cannot fail
            let _ = write!(acc, "{byte:02x}");
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

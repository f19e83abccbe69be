//! Filesystem access used by the verification pipeline.
//!
//! Going through [`FileSystem`] rather than `std::fs` lets callers observe or
//! redirect every trace file operation.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};

pub trait FileSystem: Send + Sync {
    fn exists(&self, path: &Utf8Path) -> bool;

    fn remove(&self, path: &Utf8Path) -> io::Result<()>;

    fn read(&self, path: &Utf8Path) -> io::Result<Vec<u8>>;

    /// Opens a buffered reader over the file.
    fn open(&self, path: &Utf8Path) -> io::Result<Box<dyn Read + Send>>;

    /// Appends `contents` to the file as one unit, creating it if needed.
    /// Appends to the same path never interleave.
    fn append(&self, path: &Utf8Path, contents: &[u8]) -> io::Result<()>;
}

/// Outer trace files are shared by sibling invocations; one lock per path.
static APPEND_LOCKS: LazyLock<Mutex<HashMap<Utf8PathBuf, Arc<Mutex<()>>>>> =
    LazyLock::new(Default::default);

fn append_lock(path: &Utf8Path) -> Arc<Mutex<()>> {
    let mut locks = APPEND_LOCKS.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(locks.entry(path.to_path_buf()).or_default())
}

/// Drops the table entry for `path` once no other append holds it.
fn release_append_lock(path: &Utf8Path, lock: Arc<Mutex<()>>) {
    let mut locks = APPEND_LOCKS.lock().unwrap_or_else(PoisonError::into_inner);
    drop(lock);

    // new references are only handed out under the table lock
    if locks.get(path).is_some_and(|lock| Arc::strong_count(lock) == 1) {
        locks.remove(path);
    }
}

fn append_to(path: &Utf8Path, contents: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(contents)?;
    file.flush()
}

/// The host filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl FileSystem for LocalFs {
    fn exists(&self, path: &Utf8Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    fn remove(&self, path: &Utf8Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn read(&self, path: &Utf8Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn open(&self, path: &Utf8Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }

    fn append(&self, path: &Utf8Path, contents: &[u8]) -> io::Result<()> {
        let lock = append_lock(path);
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            append_to(path, contents)
        };

        release_append_lock(path, lock);
        result
    }
}

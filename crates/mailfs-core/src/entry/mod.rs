//! The entry tree: directories backed by folders, files backed by messages
//!
//! Each node guards its mutable state with its own mutex. A file may take its
//! parent's lock while holding its own, and a directory may take its parent's,
//! never the other way round. Parents are referenced weakly; paths and folder
//! names are derived from the parent chain on demand, so renaming a directory
//! is immediately visible below it.

mod directory;
mod file;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

pub use directory::Directory;
pub use file::{File, FilePhase};

use crate::error::{FsError, FsResult};
use crate::mailbox::MailStore;
use crate::staging::StagingStore;

/// Shared handles every node needs
#[derive(Clone)]
pub(crate) struct MailContext {
    pub(crate) store: Arc<dyn MailStore>,
    pub(crate) staging: Arc<StagingStore>,
}

/// A node of the tree
#[derive(Clone, Debug)]
pub enum Entry {
    Directory(Arc<Directory>),
    File(Arc<File>),
}

impl Entry {
    pub fn name(&self) -> String {
        match self {
            Entry::Directory(dir) => dir.name(),
            Entry::File(file) => file.name(),
        }
    }

    pub fn absolute_path(&self) -> FsResult<String> {
        match self {
            Entry::Directory(dir) => dir.absolute_path(),
            Entry::File(file) => file.absolute_path(),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Entry::Directory(_))
    }

    pub fn into_directory(self) -> FsResult<Arc<Directory>> {
        match self {
            Entry::Directory(dir) => Ok(dir),
            Entry::File(_) => Err(FsError::NotADirectory),
        }
    }

    pub fn into_file(self) -> FsResult<Arc<File>> {
        match self {
            Entry::File(file) => Ok(file),
            Entry::Directory(_) => Err(FsError::NotAFile),
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Seconds since the Unix epoch.
pub(crate) fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

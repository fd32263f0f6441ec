//! Single-flight guard for a working copy.
//!
//! The lock is an advisory file lock on a sibling of the working copy (`.<name>.lock`), so it
//! excludes every run on the same path: other pipelines in this process and other processes
//! alike. The lock file sits outside the working copy because each run deletes and reclones it.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::WorkspaceError;

/// Returned when a run is already in progress for the same working copy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("a publish run is already in progress for {}", path.display())]
pub struct Busy {
    pub path: PathBuf,
}

/// Why a [`RunLock`] could not be taken.
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error(transparent)]
    Busy(#[from] Busy),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

/// Exclusive lock on one local working copy.
#[derive(Debug, Clone)]
pub struct RunLock {
    path: PathBuf,
    lock_file: PathBuf,
}

/// Proof that the holder owns the working copy. Dropping it releases the lock.
#[derive(Debug)]
pub struct RunGuard<'lock> {
    path: &'lock Path,
    file: File,
}

impl RunGuard<'_> {
    pub fn path(&self) -> &Path {
        self.path
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl RunLock {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let lock_file = lock_file_for(&path);
        Self { path, lock_file }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The file the lock is taken on.
    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    fn open(&self) -> Result<File, WorkspaceError> {
        let lock_error = |err| WorkspaceError::Lock {
            path: self.lock_file.clone(),
            err,
        };
        if let Some(parent) = self.lock_file.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(lock_error)?;
        }
        File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_file)
            .map_err(lock_error)
    }

    /// Take the lock without waiting.
    pub fn try_acquire(&self) -> Result<RunGuard<'_>, AcquireError> {
        let file = self.open()?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(RunGuard {
                path: &self.path,
                file,
            }),
            Err(err) if is_contended(&err) => Err(Busy {
                path: self.path.clone(),
            }
            .into()),
            Err(err) => Err(WorkspaceError::Lock {
                path: self.lock_file.clone(),
                err,
            }
            .into()),
        }
    }

    /// Whether any run, in this process or another, holds the lock right now.
    pub fn is_held(&self) -> bool {
        let Ok(file) = File::open(&self.lock_file) else {
            return false;
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(err) => is_contended(&err),
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == fs2::lock_contended_error().kind()
}

/// `.<name>.lock` next to `path`, or inside it when `path` has no final component.
fn lock_file_for(path: &Path) -> PathBuf {
    match path.file_name() {
        Some(name) => path.with_file_name(format!(".{}.lock", name.to_string_lossy())),
        None => path.join(".publish.lock"),
    }
}

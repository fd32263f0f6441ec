//! Preparing a clean local working copy for a run.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::WorkspaceConfig;
use crate::error::{Error, WorkspaceError};
use crate::git::VersionControlClient;

/// A freshly cloned working copy whose sync scope holds only preserved entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalWorkspace {
    root: PathBuf,
    scope_dir: PathBuf,
}

impl LocalWorkspace {
    /// The working copy root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory the archive is extracted into.
    pub fn scope_dir(&self) -> &Path {
        &self.scope_dir
    }
}

/// Brings `config.local_path` to a clean clone of `config.remote_url@config.branch`.
pub struct WorkspaceSync<'a, C: ?Sized> {
    config: &'a WorkspaceConfig,
    client: &'a C,
}

impl<'a, C: VersionControlClient + ?Sized> WorkspaceSync<'a, C> {
    pub fn new(config: &'a WorkspaceConfig, client: &'a C) -> Self {
        Self { config, client }
    }

    /// Delete any existing working copy, clone afresh and clear the sync scope.
    pub fn prepare(&self) -> Result<LocalWorkspace, Error> {
        self.reset_and_clone()?;
        Ok(self.clear_scope()?)
    }

    /// Steps 1 and 2: remove whatever is at the local path, then clone into it.
    pub fn reset_and_clone(&self) -> Result<(), Error> {
        let local = &self.config.local_path;
        if remove_path(local)? {
            tracing::info!(path = %local.display(), "Removed existing local repo");
        }
        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| WorkspaceError::Create {
                path: parent.to_path_buf(),
                err,
            })?;
        }
        tracing::info!(
            url = %self.config.display_url(),
            branch = %self.config.branch,
            path = %local.display(),
            "Cloning"
        );
        self.client
            .clone_branch(&self.config.remote_url, &self.config.branch, local)?;
        Ok(())
    }

    /// Steps 3 and 4: make sure the sync scope exists and holds only preserved entries.
    pub fn clear_scope(&self) -> Result<LocalWorkspace, WorkspaceError> {
        let scope_dir = self.config.scope_dir();
        fs::create_dir_all(&scope_dir).map_err(|err| WorkspaceError::Create {
            path: scope_dir.clone(),
            err,
        })?;
        let removed = clear_dir_except(&scope_dir, &self.config.preserved_entries)?;
        tracing::info!(
            path = %scope_dir.display(),
            removed,
            preserved = ?self.config.preserved_entries,
            "Cleaned up target directory"
        );
        Ok(LocalWorkspace {
            root: self.config.local_path.clone(),
            scope_dir,
        })
    }
}

/// Remove a file, symlink or directory tree if there is one. Returns whether anything was removed.
fn remove_path(path: &Path) -> Result<bool, WorkspaceError> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            return Err(WorkspaceError::Remove {
                path: path.to_path_buf(),
                err,
            });
        }
    };
    let removed = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    removed.map_err(|err| WorkspaceError::Remove {
        path: path.to_path_buf(),
        err,
    })?;
    Ok(true)
}

/// Delete every entry of `dir` whose name is not in `preserved`. Symlinks are removed, never
/// followed. Returns the number of entries removed.
pub fn clear_dir_except(dir: &Path, preserved: &BTreeSet<String>) -> Result<usize, WorkspaceError> {
    let list_error = |err| WorkspaceError::List {
        path: dir.to_path_buf(),
        err,
    };
    let mut removed = 0;
    for entry in fs::read_dir(dir).map_err(list_error)? {
        let entry = entry.map_err(list_error)?;
        let name = entry.file_name();
        if preserved.contains(name.to_string_lossy().as_ref()) {
            continue;
        }
        remove_path(&entry.path())?;
        removed += 1;
    }
    Ok(removed)
}

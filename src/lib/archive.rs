//! Unpacking uploaded zip archives.
//!
//! Every entry is checked before anything touches the disk: an archive with a single entry that
//! would land outside the destination (zip-slip), or with a symbolic link in it, is rejected as
//! a whole and nothing is written. The same holds for entries that would overwrite
//! version-control metadata (a `.git` component at any depth) or one of the caller's reserved
//! top-level names.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read, Seek};
use std::path::{Component, Path, PathBuf};

use crate::error::ArchiveError;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;
const VCS_DIR: &str = ".git";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Directory,
    File { executable: bool },
}

/// An archive entry that passed validation and where it will be written.
#[derive(Debug)]
struct PlannedEntry {
    index: usize,
    name: String,
    target: PathBuf,
    kind: EntryKind,
}

/// Extract the zip archive read from `archive` into `destination`, which must already exist.
/// Entries whose first path component is in `reserved` are refused, as is any entry inside a
/// `.git` directory. Returns the number of entries written.
pub fn extract<R, P>(
    archive: R,
    destination: P,
    reserved: &BTreeSet<String>,
) -> Result<usize, ArchiveError>
where
    R: Read + Seek,
    P: AsRef<Path>,
{
    let destination = destination.as_ref();
    let mut archive = zip::ZipArchive::new(archive)?;
    let plan = (0..archive.len())
        .map(|index| plan_entry(&mut archive, index, destination, reserved))
        .filter_map(Result::transpose)
        .collect::<Result<Vec<_>, _>>()?;
    for entry in &plan {
        write_entry(&mut archive, entry)?;
    }
    tracing::debug!(
        entries = plan.len(),
        destination = %destination.display(),
        "Extracted archive"
    );
    Ok(plan.len())
}

/// Extract the zip archive stored at `path` into `destination`. See [`extract`].
pub fn extract_file<P, Q>(
    path: P,
    destination: Q,
    reserved: &BTreeSet<String>,
) -> Result<usize, ArchiveError>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    let file = fs::File::open(path.as_ref()).map_err(|err| ArchiveError::Read {
        entry: path.as_ref().display().to_string(),
        err,
    })?;
    extract(io::BufReader::new(file), destination, reserved)
}

/// Validate one entry. Entries that resolve to the destination itself (e.g. `./`) are skipped.
fn plan_entry<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    index: usize,
    destination: &Path,
    reserved: &BTreeSet<String>,
) -> Result<Option<PlannedEntry>, ArchiveError> {
    let file = archive.by_index(index)?;
    let name = file.name().to_string();
    let mode = file.unix_mode();
    if mode.is_some_and(|mode| mode & S_IFMT == S_IFLNK) {
        return Err(ArchiveError::SymlinkRejected { entry: name });
    }
    let relative = sanitize_entry_path(&name)?;
    if touches_reserved(&relative, reserved) {
        return Err(ArchiveError::ReservedPath { entry: name });
    }
    let kind = if file.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File {
            executable: mode.is_some_and(|mode| mode & 0o111 != 0),
        }
    };
    if relative.as_os_str().is_empty() {
        return match kind {
            EntryKind::Directory => Ok(None),
            EntryKind::File { .. } => Err(ArchiveError::InvalidPath { entry: name }),
        };
    }
    Ok(Some(PlannedEntry {
        index,
        name,
        target: destination.join(relative),
        kind,
    }))
}

/// Turn an entry name into a path relative to the destination. Backslashes are treated as
/// separators. Absolute names, drive prefixes and `..` that climbs above the root are rejected.
pub(crate) fn sanitize_entry_path(name: &str) -> Result<PathBuf, ArchiveError> {
    if name.contains('\0') {
        return Err(ArchiveError::InvalidPath {
            entry: name.to_string(),
        });
    }
    let normalised = name.replace('\\', "/");
    let mut relative = PathBuf::new();
    for component in Path::new(&normalised).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !relative.pop() {
                    return Err(ArchiveError::PathEscape {
                        entry: name.to_string(),
                    });
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::PathEscape {
                    entry: name.to_string(),
                });
            }
        }
    }
    Ok(relative)
}

/// Whether `relative` is inside a `.git` directory, or starts with a name from `reserved`.
fn touches_reserved(relative: &Path, reserved: &BTreeSet<String>) -> bool {
    let mut components = relative.components().filter_map(|component| match component {
        Component::Normal(part) => part.to_str(),
        _ => None,
    });
    let first_reserved = components
        .clone()
        .next()
        .is_some_and(|first| reserved.contains(first));
    first_reserved || components.any(|part| part.eq_ignore_ascii_case(VCS_DIR))
}

fn create_dir_all(path: &Path) -> Result<(), ArchiveError> {
    fs::create_dir_all(path).map_err(|err| ArchiveError::Write {
        path: path.to_path_buf(),
        err,
    })
}

fn write_entry<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    entry: &PlannedEntry,
) -> Result<(), ArchiveError> {
    match entry.kind {
        EntryKind::Directory => create_dir_all(&entry.target),
        EntryKind::File { executable } => {
            if let Some(parent) = entry.target.parent() {
                create_dir_all(parent)?;
            }
            let mut contents = archive.by_index(entry.index)?;
            let mut out_file = fs::File::create(&entry.target).map_err(|err| ArchiveError::Write {
                path: entry.target.clone(),
                err,
            })?;
            io::copy(&mut contents, &mut out_file).map_err(|err| ArchiveError::Read {
                entry: entry.name.clone(),
                err,
            })?;
            set_permissions(&entry.target, executable)
        }
    }
}

#[cfg(unix)]
fn set_permissions(path: &Path, executable: bool) -> Result<(), ArchiveError> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|err| {
        ArchiveError::Write {
            path: path.to_path_buf(),
            err,
        }
    })
}

#[cfg(not(unix))]
fn set_permissions(_: &Path, _: bool) -> Result<(), ArchiveError> {
    Ok(())
}


#[cfg(test)]
mod test_extract {
    use std::io::Cursor;

    use super::test_support::zip_bytes;
    use super::*;

    fn list_files(root: &Path) -> Vec<String> {
        fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) {
            for entry in fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    walk(root, &path, out);
                } else {
                    let rel = path.strip_prefix(root).unwrap();
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        let mut out = Vec::new();
        walk(root, root, &mut out);
        out.sort();
        out
    }

    #[test]
    fn extracts_files_and_directories() {
        let dest = tempfile::tempdir().unwrap();
        let bytes = zip_bytes(&[
            ("a.txt", "alpha"),
            ("b/", ""),
            ("b/c.txt", "charlie"),
            ("b/d.txt", "delta"),
        ]);
        let count = extract(Cursor::new(bytes), dest.path(), &BTreeSet::new()).unwrap();
        assert_eq!(count, 4);
        assert_eq!(list_files(dest.path()), vec!["a.txt", "b/c.txt", "b/d.txt"]);
        assert_eq!(
            fs::read_to_string(dest.path().join("b/c.txt")).unwrap(),
            "charlie"
        );
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dest = tempfile::tempdir().unwrap();
        let bytes = zip_bytes(&[("deep/nested/file.js", "x")]);
        extract(Cursor::new(bytes), dest.path(), &BTreeSet::new()).unwrap();
        assert!(dest.path().join("deep/nested/file.js").is_file());
    }

    #[test]
    fn traversal_entry_writes_nothing() {
        let outer = tempfile::tempdir().unwrap();
        let dest = outer.path().join("dest");
        fs::create_dir(&dest).unwrap();
        let bytes = zip_bytes(&[("good.txt", "fine"), ("../evil.txt", "bad")]);
        let result = extract(Cursor::new(bytes), &dest, &BTreeSet::new());
        assert!(matches!(result, Err(ArchiveError::PathEscape { .. })));
        assert!(list_files(&dest).is_empty());
        assert!(!outer.path().join("evil.txt").exists());
    }

    #[test]
    fn symlink_entries_are_rejected() {
        let dest = tempfile::tempdir().unwrap();
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .add_symlink("link", "/etc/passwd", zip::write::SimpleFileOptions::default())
            .unwrap();
        let bytes = writer.finish().unwrap().into_inner();
        let result = extract(Cursor::new(bytes), dest.path(), &BTreeSet::new());
        assert!(matches!(result, Err(ArchiveError::SymlinkRejected { .. })));
        assert!(list_files(dest.path()).is_empty());
    }

    #[test]
    fn version_control_metadata_is_never_written() {
        let dest = tempfile::tempdir().unwrap();
        fs::create_dir_all(dest.path().join(".git/hooks")).unwrap();
        let reserved = BTreeSet::from([".git".to_string(), ".github".to_string()]);
        for name in [
            ".git/hooks/pre-commit",
            ".git/config",
            "./.git/config",
            "nested/.git/config",
            "nested/.GIT/HEAD",
            ".github/workflows/ci.yml",
        ] {
            let bytes = zip_bytes(&[("index.html", "<h1>hi</h1>"), (name, "#!/bin/sh\n")]);
            let result = extract(Cursor::new(bytes), dest.path(), &reserved);
            assert!(
                matches!(result, Err(ArchiveError::ReservedPath { ref entry }) if entry == name),
                "{name}: {result:?}"
            );
        }
        assert!(list_files(dest.path()).is_empty());
    }

    #[test]
    fn nested_repository_is_refused_without_reserved_names() {
        let dest = tempfile::tempdir().unwrap();
        let bytes = zip_bytes(&[("vendor/lib/.git/config", "[core]")]);
        let result = extract(Cursor::new(bytes), dest.path(), &BTreeSet::new());
        assert!(matches!(result, Err(ArchiveError::ReservedPath { .. })));
        assert!(!dest.path().join("vendor").exists());
    }

    #[test]
    fn reserved_names_only_match_the_first_component() {
        let dest = tempfile::tempdir().unwrap();
        let reserved = BTreeSet::from([".github".to_string()]);
        let bytes = zip_bytes(&[("docs/.github/notes.md", "ok"), (".gitignore", "target/")]);
        let count = extract(Cursor::new(bytes), dest.path(), &reserved).unwrap();
        assert_eq!(count, 2);
        assert_eq!(list_files(dest.path()), vec![".gitignore", "docs/.github/notes.md"]);
    }

    #[test]
    fn garbage_is_corrupt() {
        let dest = tempfile::tempdir().unwrap();
        let result = extract(
            Cursor::new(vec![0xde, 0xad, 0xbe, 0xef]),
            dest.path(),
            &BTreeSet::new(),
        );
        assert!(matches!(result, Err(ArchiveError::Corrupt(_))));
    }

    #[test]
    fn sanitize_keeps_relative_structure() {
        assert_eq!(
            sanitize_entry_path("src/./lib/mod.rs").unwrap(),
            PathBuf::from("src/lib/mod.rs")
        );
        assert_eq!(
            sanitize_entry_path("src\\main.rs").unwrap(),
            PathBuf::from("src/main.rs")
        );
        assert_eq!(
            sanitize_entry_path("a/b/../c.txt").unwrap(),
            PathBuf::from("a/c.txt")
        );
    }

    #[test]
    fn sanitize_rejects_escapes() {
        for name in ["../x", "a/../../x", "/etc/passwd", "\\abs\\path"] {
            assert!(
                matches!(
                    sanitize_entry_path(name),
                    Err(ArchiveError::PathEscape { .. })
                ),
                "{name} should be rejected"
            );
        }
        assert!(matches!(
            sanitize_entry_path("nul\0byte"),
            Err(ArchiveError::InvalidPath { .. })
        ));
    }
}

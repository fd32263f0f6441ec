#![allow(dead_code)]

//! Helpers shared by the integration tests: a throwaway bare "remote" seeded with a small
//! repository, and ways to inspect what ended up in it.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use publish::{Settings, WorkspaceConfig};
use tempfile::TempDir;

/// Run git in `dir` and return its stdout. Panics if git fails.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["-c", "user.name=Seed", "-c", "user.email=seed@example.com"])
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// A bare repository with one commit on `main`:
///
/// ```text
/// .github/workflows/ci.yml
/// README.md
/// app-source/old.txt
/// ```
pub struct Remote {
    pub dir: TempDir,
    pub bare: PathBuf,
}

impl Remote {
    pub fn seeded() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let bare = dir.path().join("remote.git");
        let seed = dir.path().join("seed");
        std::fs::create_dir_all(&bare).unwrap();
        git(&bare, &["init", "--bare", "--initial-branch=main"]);
        std::fs::create_dir_all(seed.join(".github/workflows")).unwrap();
        std::fs::create_dir_all(seed.join("app-source")).unwrap();
        std::fs::write(seed.join(".github/workflows/ci.yml"), "on: push\n").unwrap();
        std::fs::write(seed.join("README.md"), "# demo\n").unwrap();
        std::fs::write(seed.join("app-source/old.txt"), "old\n").unwrap();
        git(&seed, &["init", "--initial-branch=main"]);
        git(&seed, &["add", "-A"]);
        git(&seed, &["commit", "-m", "initial"]);
        git(&seed, &["push", bare.to_str().unwrap(), "main"]);
        Self { dir, bare }
    }

    pub fn url(&self) -> String {
        self.bare.display().to_string()
    }

    /// Where a pipeline under test should keep its working copy.
    pub fn local_path(&self) -> PathBuf {
        self.dir.path().join("work/clone")
    }

    /// Every file on `main`, sorted.
    pub fn files(&self) -> Vec<String> {
        let mut files: Vec<String> = git(&self.bare, &["ls-tree", "-r", "--name-only", "main"])
            .lines()
            .map(String::from)
            .collect();
        files.sort();
        files
    }

    pub fn commit_count(&self) -> usize {
        git(&self.bare, &["rev-list", "--count", "main"])
            .trim()
            .parse()
            .unwrap()
    }

    /// `Name <email>` of the commit at the tip of `main`.
    pub fn head_author(&self) -> String {
        git(&self.bare, &["log", "-1", "--format=%an <%ae>", "main"])
            .trim()
            .to_string()
    }

    pub fn head_subject(&self) -> String {
        git(&self.bare, &["log", "-1", "--format=%s", "main"])
            .trim()
            .to_string()
    }

    /// Configuration publishing into this remote.
    pub fn config(&self, vars: &[(&str, &str)]) -> WorkspaceConfig {
        let url = self.url();
        let local = self.local_path().display().to_string();
        let mut all = vec![
            ("APP_REPO_URL", url.as_str()),
            ("APP_REPO_LOCAL_PATH", local.as_str()),
        ];
        all.extend_from_slice(vars);
        Settings::from_vars(all.iter().map(|(k, v)| (*k, v.to_string())))
            .unwrap()
            .workspace()
            .unwrap()
    }
}

/// Build an in-memory zip. Names ending in `/` become directories.
pub fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, contents) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
    }
    writer.finish().unwrap().into_inner()
}

/// The three-file archive used by the end-to-end scenarios.
pub fn three_file_archive() -> Vec<u8> {
    zip_bytes(&[
        ("a.txt", "alpha\n"),
        ("b/", ""),
        ("b/c.txt", "charlie\n"),
        ("b/d.txt", "delta\n"),
    ])
}

/// Submit `archive` through a fresh service, the way the server does.
pub fn publish_with<C: publish::VersionControlClient>(
    config: WorkspaceConfig,
    client: C,
    archive: Vec<u8>,
) -> publish::SubmitOutcome {
    let uploads = config.local_path.with_file_name("uploads");
    publish::PublishService::new(publish::PublishPipeline::new(config, client))
        .with_uploads_dir(Some(uploads))
        .submit(Some(publish::Upload::new("source.zip", archive)))
}

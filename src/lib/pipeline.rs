//! One publish run: receive, clone, clean, extract, commit and push.
//!
//! A run is strictly sequential. The first stage that fails ends it with a [`Failure`] naming
//! that stage; the working copy is left as it is, since the next run deletes and reclones it
//! anyway. The uploaded archive lives in a [`PublishRequest`] whose temporary file is removed when
//! the request is dropped or [closed](PublishRequest::close), whatever the outcome.

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;

use crate::archive;
use crate::config::{SyncScope, WorkspaceConfig};
use crate::error::{Error, InputError};
use crate::git::VersionControlClient;
use crate::lock::{AcquireError, RunGuard, RunLock};
use crate::publisher::{PushOutcome, RemotePublisher, commit_message};
use crate::workspace::WorkspaceSync;

/// The stage a run was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Receive,
    Clone,
    Clean,
    Extract,
    Publish,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Receive => write!(f, "receive"),
            Stage::Clone => write!(f, "clone"),
            Stage::Clean => write!(f, "clean"),
            Stage::Extract => write!(f, "extract"),
            Stage::Publish => write!(f, "publish"),
        }
    }
}

/// States a run moves through, in order. `Committed` and `NoOp` are alternatives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Received,
    Cloned,
    Cleaned,
    Extracted,
    Committed,
    NoOp,
    Done,
    Failed(Stage),
}

/// A completed step, as reported back to whoever submitted the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Status {
    Uploaded,
    Cloned,
    Cleaned,
    Unzipped,
    NoChanges,
    Pushed,
}

/// Outcome of a run that got all the way through.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PublishResult {
    /// The final step: [`Status::Pushed`] or [`Status::NoChanges`].
    pub status: Status,
    /// Every step completed, in order.
    pub stages: Vec<Status>,
    /// Human-readable account of the run.
    pub message: String,
    pub archive_name: String,
    pub entries_extracted: usize,
    /// Set only when a commit was pushed.
    pub commit_message: Option<String>,
}

/// A run that stopped at `stage`.
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed: {error}")]
pub struct Failure {
    pub stage: Stage,
    #[source]
    pub error: Error,
    /// Steps completed before the failure.
    pub stages: Vec<Status>,
    /// Account of the steps completed before the failure.
    pub narrative: String,
}

impl Failure {
    fn new(stage: Stage, error: Error, narrative: &Narrative) -> Self {
        tracing::error!(%stage, error = %error_chain(&error), "Publish run failed");
        Self {
            stage,
            error,
            stages: narrative.stages.clone(),
            narrative: narrative.text.clone(),
        }
    }

    /// The text sent back to the submitter, including any output the failed command printed.
    pub fn report(&self) -> String {
        let mut report = format!("Error processing file. {} ", error_chain(&self.error));
        if let Some((stdout, stderr)) = self.error.captured_output() {
            report.push_str(&format!(
                "STDERR: {} STDOUT: {}",
                stderr.trim(),
                stdout.trim()
            ));
        }
        report.trim_end().to_string()
    }
}

/// Render an error followed by its sources, separated by `: `.
pub(crate) fn error_chain(error: &dyn std::error::Error) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(err) = source {
        text.push_str(": ");
        text.push_str(&err.to_string());
        source = err.source();
    }
    text
}

/// An archive as it arrived from the submitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub file_name: String,
    pub contents: Vec<u8>,
}

impl Upload {
    pub fn new<S: Into<String>>(file_name: S, contents: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            contents,
        }
    }

    /// Read an archive from the local filesystem.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, InputError> {
        let path = path.as_ref();
        let contents = std::fs::read(path).map_err(|err| InputError::ReadArchive {
            path: path.to_path_buf(),
            err,
        })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.zip".to_string());
        Ok(Self {
            file_name,
            contents,
        })
    }
}

/// An upload stored to a temporary file, owned by exactly one run.
#[derive(Debug)]
pub struct PublishRequest {
    archive: NamedTempFile,
    archive_name: String,
    received_at: DateTime<Utc>,
}

impl PublishRequest {
    /// Store `upload` in `uploads_dir` (the system temp dir if `None`) under a name prefixed
    /// with the receive time.
    pub fn store(upload: &Upload, uploads_dir: Option<&Path>) -> Result<Self, InputError> {
        let received_at = Utc::now();
        let store_error = |err| InputError::Store {
            name: upload.file_name.clone(),
            err,
        };
        let prefix = format!("{}-", received_at.timestamp_millis());
        let suffix = format!("-{}", safe_file_name(&upload.file_name));
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix).suffix(&suffix).rand_bytes(6);
        let mut archive = match uploads_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(store_error)?;
                builder.tempfile_in(dir)
            }
            None => builder.tempfile(),
        }
        .map_err(store_error)?;
        archive
            .write_all(&upload.contents)
            .and_then(|_| archive.flush())
            .map_err(store_error)?;
        tracing::info!(
            name = %upload.file_name,
            path = %archive.path().display(),
            bytes = upload.contents.len(),
            "Stored upload"
        );
        Ok(Self {
            archive,
            archive_name: upload.file_name.clone(),
            received_at,
        })
    }

    pub fn archive_name(&self) -> &str {
        &self.archive_name
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Where the archive is stored until the request is closed.
    pub fn path(&self) -> &Path {
        self.archive.path()
    }

    /// Delete the stored archive.
    pub fn close(self) {
        let path = self.archive.path().to_path_buf();
        match self.archive.close() {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed upload"),
            Err(err) => tracing::warn!(path = %path.display(), error = %err, "Failed to remove upload"),
        }
    }
}

/// Keep only the final path segment of a client-supplied name, with anything unusual replaced.
fn safe_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "upload.zip".to_string(),
        _ => cleaned,
    }
}

#[derive(Debug, Default)]
struct Narrative {
    stages: Vec<Status>,
    text: String,
}

impl Narrative {
    fn record(&mut self, status: Status, text: &str) {
        self.stages.push(status);
        self.text.push_str(text);
    }
}

type Observer = Box<dyn Fn(RunState) + Send + Sync>;

/// Publishes archives into one configured working copy, one run at a time.
pub struct PublishPipeline<C> {
    config: WorkspaceConfig,
    client: C,
    lock: RunLock,
    observer: Option<Observer>,
}

impl<C: VersionControlClient> PublishPipeline<C> {
    pub fn new(config: WorkspaceConfig, client: C) -> Self {
        let lock = RunLock::new(config.local_path.clone());
        Self {
            config,
            client,
            lock,
            observer: None,
        }
    }

    /// Call `observer` on every state change of every run.
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(RunState) + Send + Sync + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    /// Claim the working copy for one run. Fails with [`Busy`](crate::Busy) while another run
    /// holds it, whether in this pipeline, another one on the same path, or another process.
    pub fn try_acquire(&self) -> Result<RunGuard<'_>, AcquireError> {
        self.lock.try_acquire()
    }

    pub fn is_running(&self) -> bool {
        self.lock.is_held()
    }

    fn enter(&self, state: RunState) {
        match state {
            RunState::Failed(stage) => tracing::warn!(%stage, "Run failed"),
            state => tracing::info!(?state, "Run state"),
        }
        if let Some(observer) = &self.observer {
            observer(state);
        }
    }

    fn fail(&self, stage: Stage, error: Error, narrative: &Narrative) -> Failure {
        self.enter(RunState::Failed(stage));
        Failure::new(stage, error, narrative)
    }

    /// Run every stage for `request`. `guard` must come from [`try_acquire`](Self::try_acquire)
    /// on this pipeline.
    pub fn run(
        &self,
        guard: &RunGuard<'_>,
        request: &PublishRequest,
    ) -> Result<PublishResult, Failure> {
        debug_assert_eq!(guard.path(), self.config.local_path.as_path());
        let mut narrative = Narrative::default();
        let scope_label = scope_label(&self.config.scope);

        self.enter(RunState::Received);
        narrative.record(
            Status::Uploaded,
            &format!("File {} uploaded. ", request.archive_name()),
        );

        let sync = WorkspaceSync::new(&self.config, &self.client);
        sync.reset_and_clone()
            .map_err(|err| self.fail(Stage::Clone, err, &narrative))?;
        self.enter(RunState::Cloned);
        narrative.record(Status::Cloned, "Repository cloned. ");

        let workspace = sync
            .clear_scope()
            .map_err(|err| self.fail(Stage::Clean, err.into(), &narrative))?;
        self.enter(RunState::Cleaned);
        narrative.record(
            Status::Cleaned,
            &format!("Cleaned up target directory {scope_label}. "),
        );

        let entries_extracted = archive::extract_file(
            request.path(),
            workspace.scope_dir(),
            &self.config.preserved_entries,
        )
        .map_err(|err| self.fail(Stage::Extract, err.into(), &narrative))?;
        self.enter(RunState::Extracted);
        narrative.record(
            Status::Unzipped,
            &format!("New code unzipped into {scope_label}. "),
        );

        let message = commit_message(&self.config.scope, Utc::now());
        let outcome = RemotePublisher::new(&self.client)
            .commit_and_push(workspace.root(), &self.config.branch, &message)
            .map_err(|err| self.fail(Stage::Publish, err.into(), &narrative))?;
        let (status, commit_message) = match outcome {
            PushOutcome::Pushed => {
                self.enter(RunState::Committed);
                narrative.record(
                    Status::Pushed,
                    "Changes committed and pushed. CI/CD pipeline triggered.",
                );
                (Status::Pushed, Some(message))
            }
            PushOutcome::NoChanges => {
                self.enter(RunState::NoOp);
                narrative.record(Status::NoChanges, "No changes detected to push.");
                (Status::NoChanges, None)
            }
        };
        self.enter(RunState::Done);
        Ok(PublishResult {
            status,
            stages: narrative.stages,
            message: narrative.text,
            archive_name: request.archive_name().to_string(),
            entries_extracted,
            commit_message,
        })
    }
}

/// `./<subdir>` for a subdirectory scope, `./` for the repository root.
fn scope_label(scope: &SyncScope) -> String {
    match scope {
        SyncScope::Root => "./".to_string(),
        SyncScope::Subdir(subdir) => format!("./{}", subdir.display()),
    }
}

#[cfg(test)]
mod test_pipeline {
    use std::collections::BTreeSet;
    use std::fs;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use std::path::PathBuf;

    use super::*;
    use crate::archive::test_support::zip_bytes;
    use crate::error::{ArchiveError, RemoteError, RemoteErrorKind};
    use crate::git::MockVersionControlClient;

    fn config(root: &Path) -> WorkspaceConfig {
        WorkspaceConfig {
            remote_url: "https://example.com/repo.git".to_string(),
            branch: "main".to_string(),
            local_path: root.join("clone"),
            scope: SyncScope::Subdir(PathBuf::from("app-source")),
            preserved_entries: BTreeSet::new(),
            git_timeout: Duration::from_secs(5),
        }
    }

    fn expect_clone(client: &mut MockVersionControlClient) {
        client.expect_clone_branch().returning(|_, _, into| {
            fs::create_dir_all(into.join(".git")).unwrap();
            fs::create_dir_all(into.join("app-source")).unwrap();
            fs::write(into.join("app-source/stale.txt"), "old").unwrap();
            Ok(())
        });
    }

    fn list_files(dir: &Path) -> Vec<PathBuf> {
        fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) {
            for entry in fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    walk(root, &path, out);
                } else {
                    out.push(path.strip_prefix(root).unwrap().to_path_buf());
                }
            }
        }
        let mut files = Vec::new();
        walk(dir, dir, &mut files);
        files.sort();
        files
    }

    fn request(dir: &Path, entries: &[(&str, &str)]) -> PublishRequest {
        PublishRequest::store(&Upload::new("site.zip", zip_bytes(entries)), Some(dir)).unwrap()
    }

    #[test]
    fn changed_content_is_pushed() {
        let tmp = tempfile::tempdir().unwrap();
        let mut client = MockVersionControlClient::new();
        expect_clone(&mut client);
        client.expect_set_identity().returning(|_, _| Ok(()));
        client.expect_stage_all().returning(|_| Ok(()));
        client.expect_status_is_clean().returning(|_| Ok(false));
        client
            .expect_commit_all()
            .withf(|_, message| {
                message.starts_with("CI: Update application source in app-source via web upload - ")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        client.expect_push().times(1).returning(|_, _| Ok(()));

        let states = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&states);
        let pipeline = PublishPipeline::new(config(tmp.path()), client)
            .with_observer(move |state| seen.lock().unwrap().push(state));
        let request = request(
            &tmp.path().join("uploads"),
            &[("a.txt", "a"), ("b/", ""), ("b/c.txt", "c"), ("b/d.txt", "d")],
        );
        let guard = pipeline.try_acquire().unwrap();
        let result = pipeline.run(&guard, &request).unwrap();

        assert_eq!(result.status, Status::Pushed);
        assert_eq!(
            result.message,
            "File site.zip uploaded. Repository cloned. Cleaned up target directory ./app-source. \
             New code unzipped into ./app-source. Changes committed and pushed. CI/CD pipeline triggered."
        );
        assert_eq!(
            result.stages,
            vec![
                Status::Uploaded,
                Status::Cloned,
                Status::Cleaned,
                Status::Unzipped,
                Status::Pushed
            ]
        );
        assert!(result.commit_message.is_some());
        assert_eq!(
            list_files(&tmp.path().join("clone/app-source")),
            vec![
                PathBuf::from("a.txt"),
                PathBuf::from("b/c.txt"),
                PathBuf::from("b/d.txt")
            ]
        );
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                RunState::Received,
                RunState::Cloned,
                RunState::Cleaned,
                RunState::Extracted,
                RunState::Committed,
                RunState::Done
            ]
        );
    }

    #[test]
    fn unchanged_content_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let mut client = MockVersionControlClient::new();
        expect_clone(&mut client);
        client.expect_set_identity().returning(|_, _| Ok(()));
        client.expect_stage_all().returning(|_| Ok(()));
        client.expect_status_is_clean().returning(|_| Ok(true));
        client.expect_commit_all().never();
        client.expect_push().never();
        let pipeline = PublishPipeline::new(config(tmp.path()), client);
        let request = request(tmp.path(), &[("a.txt", "a")]);
        let guard = pipeline.try_acquire().unwrap();
        let result = pipeline.run(&guard, &request).unwrap();
        assert_eq!(result.status, Status::NoChanges);
        assert!(result.message.ends_with("No changes detected to push."));
        assert_eq!(result.commit_message, None);
    }

    #[test]
    fn traversal_archive_fails_at_extract_and_never_commits() {
        let tmp = tempfile::tempdir().unwrap();
        let mut client = MockVersionControlClient::new();
        expect_clone(&mut client);
        client.expect_set_identity().never();
        client.expect_commit_all().never();
        client.expect_push().never();
        let pipeline = PublishPipeline::new(config(tmp.path()), client);
        let request = request(tmp.path(), &[("ok.txt", "x"), ("../evil.txt", "x")]);
        let guard = pipeline.try_acquire().unwrap();
        let failure = pipeline.run(&guard, &request).unwrap_err();
        assert_eq!(failure.stage, Stage::Extract);
        assert!(matches!(
            failure.error,
            Error::Archive(ArchiveError::PathEscape { .. })
        ));
        assert_eq!(
            failure.stages,
            vec![Status::Uploaded, Status::Cloned, Status::Cleaned]
        );
        assert!(!tmp.path().join("evil.txt").exists());
        assert!(!tmp.path().join("clone/app-source/ok.txt").exists());
    }

    #[test]
    fn clone_failure_report_carries_command_output() {
        let tmp = tempfile::tempdir().unwrap();
        let mut client = MockVersionControlClient::new();
        client.expect_clone_branch().returning(|_, _, _| {
            Err(RemoteError::Timeout {
                command: "git clone --branch main https://example.com/repo.git clone".to_string(),
                timeout: Duration::from_secs(5),
                stdout: "partial\n".to_string(),
                stderr: "Cloning into 'clone'...\n".to_string(),
            })
        });
        let pipeline = PublishPipeline::new(config(tmp.path()), client);
        let request = request(tmp.path(), &[("a.txt", "a")]);
        let guard = pipeline.try_acquire().unwrap();
        let failure = pipeline.run(&guard, &request).unwrap_err();
        assert_eq!(failure.stage, Stage::Clone);
        assert!(matches!(&failure.error, Error::Remote(err) if err.kind() == RemoteErrorKind::Timeout));
        assert_eq!(
            failure.report(),
            "Error processing file. Command 'git clone --branch main https://example.com/repo.git clone' \
             timed out after 5s STDERR: Cloning into 'clone'... STDOUT: partial"
        );
        assert_eq!(failure.narrative, "File site.zip uploaded. ");
    }

    #[cfg(unix)]
    #[test]
    fn failed_command_output_is_reported_once() {
        use std::os::unix::process::ExitStatusExt;

        let tmp = tempfile::tempdir().unwrap();
        let mut client = MockVersionControlClient::new();
        client.expect_clone_branch().returning(|_, _, _| {
            Err(RemoteError::Subprocess {
                kind: RemoteErrorKind::BranchNotFound,
                command: "git clone --branch main https://example.com/repo.git clone".to_string(),
                status: std::process::ExitStatus::from_raw(128 << 8),
                stdout: String::new(),
                stderr: "fatal: Remote branch main not found in upstream origin\n".to_string(),
            })
        });
        let pipeline = PublishPipeline::new(config(tmp.path()), client);
        let request = request(tmp.path(), &[("a.txt", "a")]);
        let guard = pipeline.try_acquire().unwrap();
        let report = pipeline.run(&guard, &request).unwrap_err().report();
        assert_eq!(report.matches("Remote branch main not found").count(), 1, "{report}");
        assert!(
            report.ends_with("STDERR: fatal: Remote branch main not found in upstream origin STDOUT:"),
            "{report}"
        );
    }

    #[test]
    fn archive_cannot_plant_hooks_at_root_scope() {
        let tmp = tempfile::tempdir().unwrap();
        let mut client = MockVersionControlClient::new();
        client.expect_clone_branch().returning(|_, _, into| {
            fs::create_dir_all(into.join(".git/hooks")).unwrap();
            fs::write(into.join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
            Ok(())
        });
        client.expect_set_identity().never();
        client.expect_commit_all().never();
        client.expect_push().never();
        let mut config = config(tmp.path());
        config.scope = SyncScope::Root;
        config.preserved_entries = BTreeSet::from([".git".to_string()]);
        let pipeline = PublishPipeline::new(config, client);
        let request = request(
            tmp.path(),
            &[("index.html", "<h1>hi</h1>"), (".git/hooks/pre-commit", "#!/bin/sh\n")],
        );
        let guard = pipeline.try_acquire().unwrap();
        let failure = pipeline.run(&guard, &request).unwrap_err();
        assert_eq!(failure.stage, Stage::Extract);
        assert!(matches!(
            failure.error,
            Error::Archive(ArchiveError::ReservedPath { .. })
        ));
        assert!(!tmp.path().join("clone/.git/hooks/pre-commit").exists());
        assert!(!tmp.path().join("clone/index.html").exists());
        assert_eq!(
            fs::read_to_string(tmp.path().join("clone/.git/HEAD")).unwrap(),
            "ref: refs/heads/main\n"
        );
    }

    #[test]
    fn request_file_is_removed_on_close() {
        let tmp = tempfile::tempdir().unwrap();
        let request = request(tmp.path(), &[("a.txt", "a")]);
        let path = request.path().to_path_buf();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("-site.zip"), "{name}");
        assert!(name.split('-').next().unwrap().parse::<i64>().is_ok(), "{name}");
        assert!(path.exists());
        request.close();
        assert!(!path.exists());
    }

    #[test]
    fn client_file_names_are_flattened() {
        assert_eq!(safe_file_name("../../etc/passwd"), "passwd");
        assert_eq!(safe_file_name("C:\\Users\\me\\my site.zip"), "my_site.zip");
        assert_eq!(safe_file_name(".."), "upload.zip");
        assert_eq!(safe_file_name(""), "upload.zip");
    }

    #[test]
    fn second_acquire_while_running_is_busy() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = PublishPipeline::new(config(tmp.path()), MockVersionControlClient::new());
        let _guard = pipeline.try_acquire().unwrap();
        assert!(pipeline.is_running());
        assert!(matches!(pipeline.try_acquire(), Err(AcquireError::Busy(_))));
    }

    #[test]
    fn pipelines_sharing_a_working_copy_exclude_each_other() {
        let tmp = tempfile::tempdir().unwrap();
        let first = PublishPipeline::new(config(tmp.path()), MockVersionControlClient::new());
        let second = PublishPipeline::new(config(tmp.path()), MockVersionControlClient::new());
        let guard = first.try_acquire().unwrap();
        assert!(second.is_running());
        match second.try_acquire() {
            Err(AcquireError::Busy(busy)) => assert_eq!(busy.path, tmp.path().join("clone")),
            other => panic!("expected Busy, got {other:?}"),
        }
        drop(guard);
        assert!(second.try_acquire().is_ok());
    }
}

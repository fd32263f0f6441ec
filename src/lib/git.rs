//! Version-control operations used by a publish run.
//!
//! The pipeline only talks to [`VersionControlClient`]. [`GitCli`] implements it by running the
//! `git` executable (which must be on `PATH`); with the `libgit2` feature,
//! [`Git2Client`](crate::Git2Client) implements it natively.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::redact_url;
use crate::error::{RemoteError, RemoteErrorKind};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Author and committer recorded on published commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub name: &'static str,
    pub email: &'static str,
}

/// The version-control capabilities a publish run needs.
#[cfg_attr(test, mockall::automock)]
pub trait VersionControlClient: Send + Sync {
    /// Clone `branch` of `url` into `into`, which must not exist yet.
    fn clone_branch(&self, url: &str, branch: &str, into: &Path) -> Result<(), RemoteError>;

    /// Configure the author/committer identity used by later commits in `repo`.
    fn set_identity(&self, repo: &Path, identity: &Identity) -> Result<(), RemoteError>;

    /// Stage every change in the working tree: additions, modifications and deletions.
    fn stage_all(&self, repo: &Path) -> Result<(), RemoteError>;

    /// Whether the working tree and index have nothing to commit.
    fn status_is_clean(&self, repo: &Path) -> Result<bool, RemoteError>;

    /// Commit everything staged.
    fn commit_all(&self, repo: &Path, message: &str) -> Result<(), RemoteError>;

    /// Push `branch` to `origin`.
    fn push(&self, repo: &Path, branch: &str) -> Result<(), RemoteError>;
}

impl<T: VersionControlClient + ?Sized> VersionControlClient for Box<T> {
    fn clone_branch(&self, url: &str, branch: &str, into: &Path) -> Result<(), RemoteError> {
        (**self).clone_branch(url, branch, into)
    }

    fn set_identity(&self, repo: &Path, identity: &Identity) -> Result<(), RemoteError> {
        (**self).set_identity(repo, identity)
    }

    fn stage_all(&self, repo: &Path) -> Result<(), RemoteError> {
        (**self).stage_all(repo)
    }

    fn status_is_clean(&self, repo: &Path) -> Result<bool, RemoteError> {
        (**self).status_is_clean(repo)
    }

    fn commit_all(&self, repo: &Path, message: &str) -> Result<(), RemoteError> {
        (**self).commit_all(repo, message)
    }

    fn push(&self, repo: &Path, branch: &str) -> Result<(), RemoteError> {
        (**self).push(repo, branch)
    }
}

/// Runs the `git` executable as a subprocess.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
    timeout: Duration,
}

#[derive(Debug, Default)]
struct CommandOutput {
    stdout: String,
}

impl GitCli {
    /// Network operations (clone, push) are killed after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: "git".to_string(),
            timeout,
        }
    }

    /// Use a different executable than `git` from `PATH`.
    pub fn with_program<S: Into<String>>(mut self, program: S) -> Self {
        self.program = program.into();
        self
    }

    fn git(&self, repo: Option<&Path>) -> Command {
        let mut git = Command::new(&self.program);
        if let Some(repo) = repo {
            git.arg("-C").arg(repo);
        }
        // Never wait for credentials on a terminal nobody is watching
        git.env("GIT_TERMINAL_PROMPT", "0");
        git.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());
        git
    }

    fn run(
        &self,
        mut command: Command,
        description: String,
        timeout: Option<Duration>,
        secret: Option<&str>,
    ) -> Result<CommandOutput, RemoteError> {
        tracing::debug!(command = %description, "Running git");
        let mut child = command.spawn().map_err(|err| RemoteError::Launch {
            command: description.clone(),
            err,
        })?;
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);
        let waited = match timeout {
            Some(timeout) => wait_with_deadline(&mut child, timeout),
            None => child.wait().map(Some),
        };
        let status = waited.map_err(|err| RemoteError::Launch {
            command: description.clone(),
            err,
        })?;
        let timed_out = status.is_none();
        let redact = |text: String| match secret {
            Some(secret) => text.replace(secret, &redact_url(secret)),
            None => text,
        };
        let stdout = redact(collect(stdout, timed_out));
        let stderr = redact(collect(stderr, timed_out));
        match status {
            Some(status) if status.success() => Ok(CommandOutput { stdout }),
            Some(status) => {
                let kind = classify_stderr(&stderr);
                tracing::error!(command = %description, %status, %kind, "git failed");
                Err(RemoteError::Subprocess {
                    kind,
                    command: description,
                    status,
                    stdout,
                    stderr,
                })
            }
            None => {
                let timeout = timeout.unwrap_or_default();
                tracing::error!(command = %description, timeout_secs = timeout.as_secs(), "git timed out");
                Err(RemoteError::Timeout {
                    command: description,
                    timeout,
                    stdout,
                    stderr,
                })
            }
        }
    }
}

impl VersionControlClient for GitCli {
    fn clone_branch(&self, url: &str, branch: &str, into: &Path) -> Result<(), RemoteError> {
        let mut git = self.git(None);
        git.args(["clone", "--branch", branch, "--"])
            .arg(url)
            .arg(into);
        let description = format!(
            "git clone --branch {branch} {} {}",
            redact_url(url),
            into.display()
        );
        self.run(git, description, Some(self.timeout), Some(url))
            .map(|_| ())
    }

    fn set_identity(&self, repo: &Path, identity: &Identity) -> Result<(), RemoteError> {
        for (key, value) in [("user.name", identity.name), ("user.email", identity.email)] {
            let mut git = self.git(Some(repo));
            git.args(["config", key, value]);
            self.run(git, format!("git config {key} \"{value}\""), None, None)?;
        }
        Ok(())
    }

    fn stage_all(&self, repo: &Path) -> Result<(), RemoteError> {
        let mut git = self.git(Some(repo));
        git.args(["add", "-A"]);
        self.run(git, "git add -A".to_string(), None, None)
            .map(|_| ())
    }

    fn status_is_clean(&self, repo: &Path) -> Result<bool, RemoteError> {
        let mut git = self.git(Some(repo));
        git.args(["status", "--porcelain"]);
        let output = self.run(git, "git status --porcelain".to_string(), None, None)?;
        Ok(output.stdout.trim().is_empty())
    }

    fn commit_all(&self, repo: &Path, message: &str) -> Result<(), RemoteError> {
        let mut git = self.git(Some(repo));
        git.args(["commit", "-m", message]);
        self.run(git, format!("git commit -m \"{message}\""), None, None)
            .map(|_| ())
    }

    fn push(&self, repo: &Path, branch: &str) -> Result<(), RemoteError> {
        let mut git = self.git(Some(repo));
        git.args(["push", "origin", branch]);
        self.run(
            git,
            format!("git push origin {branch}"),
            Some(self.timeout),
            None,
        )
        .map(|_| ())
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Join a pipe reader. After a timeout a grandchild (e.g. `git-remote-https`) may still hold the
/// pipe open, so only wait a short while for it.
fn collect(handle: Option<JoinHandle<String>>, timed_out: bool) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    if timed_out {
        let deadline = Instant::now() + DRAIN_GRACE;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
        }
        if !handle.is_finished() {
            return String::new();
        }
    }
    handle.join().unwrap_or_default()
}

/// Wait for `child` to exit, killing it once `timeout` has elapsed. `None` means it was killed.
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Work out why git failed from what it printed.
pub(crate) fn classify_stderr(stderr: &str) -> RemoteErrorKind {
    let stderr = stderr.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|needle| stderr.contains(needle));
    if any(&[
        "authentication failed",
        "could not read username",
        "could not read password",
        "permission denied",
        "invalid username or password",
        "terminal prompts disabled",
        "the requested url returned error: 403",
        "the requested url returned error: 401",
    ]) {
        RemoteErrorKind::AuthFailure
    } else if any(&["remote branch", "couldn't find remote ref"])
        && any(&["not found", "couldn't find"])
    {
        RemoteErrorKind::BranchNotFound
    } else if any(&[
        "could not resolve host",
        "unable to access",
        "connection refused",
        "connection timed out",
        "network is unreachable",
        "could not read from remote repository",
        "does not appear to be a git repository",
    ]) {
        RemoteErrorKind::NetworkFailure
    } else {
        RemoteErrorKind::Other
    }
}

//! Committing a prepared working copy and pushing it to the remote.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::config::SyncScope;
use crate::error::RemoteError;
use crate::git::{Identity, VersionControlClient};

/// Committer recorded on every published commit.
pub const BOT_IDENTITY: Identity = Identity {
    name: "Upload-App Bot",
    email: "upload-app-bot@example.com",
};

/// What [`RemotePublisher::commit_and_push`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum PushOutcome {
    /// A commit was created and pushed.
    Pushed,
    /// The working copy matched the remote; nothing was committed or pushed.
    NoChanges,
}

/// Stages, commits and pushes a prepared working copy.
pub struct RemotePublisher<'a, C: ?Sized> {
    client: &'a C,
}

impl<'a, C: VersionControlClient + ?Sized> RemotePublisher<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    /// Commit everything under `local_path` as the bot and push it to `origin/branch`.
    /// Nothing is committed or pushed when there are no changes.
    pub fn commit_and_push(
        &self,
        local_path: &Path,
        branch: &str,
        message: &str,
    ) -> Result<PushOutcome, RemoteError> {
        self.client.set_identity(local_path, &BOT_IDENTITY)?;
        self.client.stage_all(local_path)?;
        if self.client.status_is_clean(local_path)? {
            tracing::info!(path = %local_path.display(), "No changes detected to push");
            return Ok(PushOutcome::NoChanges);
        }
        self.client.commit_all(local_path, message)?;
        tracing::info!(%message, "Committed");
        self.client.push(local_path, branch)?;
        tracing::info!(%branch, "Pushed");
        Ok(PushOutcome::Pushed)
    }
}

/// The commit message for a publish into `scope` at `at`.
pub fn commit_message(scope: &SyncScope, at: DateTime<Utc>) -> String {
    format!(
        "CI: Update application source in {scope} via web upload - {}",
        at.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

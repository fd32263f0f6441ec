//! The "submit archive for publish" operation, as seen by whoever delivers uploads.

use std::path::PathBuf;

use crate::error::{ConfigError, Error};
use crate::git::VersionControlClient;
use crate::lock::AcquireError;
use crate::pipeline::{Failure, PublishPipeline, PublishRequest, PublishResult, Stage, Upload};

/// Every way a submission can end.
#[derive(Debug)]
pub enum SubmitOutcome {
    NoFileProvided,
    /// Configuration is missing or invalid; nothing was touched.
    ServerMisconfigured(String),
    /// Another run holds the working copy.
    Busy,
    Success(PublishResult),
    Failure(Failure),
}

impl SubmitOutcome {
    /// Text for the submitter.
    pub fn message(&self) -> String {
        match self {
            SubmitOutcome::NoFileProvided => "No file uploaded.".to_string(),
            SubmitOutcome::ServerMisconfigured(reason) => {
                format!("Server configuration error: {reason}")
            }
            SubmitOutcome::Busy => {
                "A publish is already in progress, try again when it has finished.".to_string()
            }
            SubmitOutcome::Success(result) => result.message.clone(),
            SubmitOutcome::Failure(failure) => failure.report(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SubmitOutcome::Success(_))
    }
}

/// Accepts uploads and runs them through a [`PublishPipeline`], one at a time.
///
/// A service built from invalid configuration still accepts submissions but answers every one
/// with [`SubmitOutcome::ServerMisconfigured`] without touching the filesystem.
pub struct PublishService<C> {
    pipeline: Result<PublishPipeline<C>, ConfigError>,
    uploads_dir: Option<PathBuf>,
}

impl<C: VersionControlClient> PublishService<C> {
    pub fn new(pipeline: PublishPipeline<C>) -> Self {
        Self {
            pipeline: Ok(pipeline),
            uploads_dir: None,
        }
    }

    /// A service that rejects every submission because of `err`.
    pub fn unconfigured(err: ConfigError) -> Self {
        Self {
            pipeline: Err(err),
            uploads_dir: None,
        }
    }

    /// Where uploads are stored while they are processed. Defaults to the system temp dir.
    pub fn with_uploads_dir<P: Into<PathBuf>>(mut self, dir: Option<P>) -> Self {
        self.uploads_dir = dir.map(Into::into);
        self
    }

    pub fn pipeline(&self) -> Option<&PublishPipeline<C>> {
        self.pipeline.as_ref().ok()
    }

    /// Publish `upload`. Checks run in order: configuration, presence of a file, then the run lock.
    /// The stored archive is deleted before this returns, whatever the outcome.
    pub fn submit(&self, upload: Option<Upload>) -> SubmitOutcome {
        let pipeline = match &self.pipeline {
            Ok(pipeline) => pipeline,
            Err(err) => {
                tracing::error!(error = %err, "Rejecting upload, server is not configured");
                return SubmitOutcome::ServerMisconfigured(err.to_string());
            }
        };
        let Some(upload) = upload else {
            tracing::warn!("Upload request without a file");
            return SubmitOutcome::NoFileProvided;
        };
        let guard = match pipeline.try_acquire() {
            Ok(guard) => guard,
            Err(AcquireError::Busy(busy)) => {
                tracing::warn!(name = %upload.file_name, "{busy}");
                return SubmitOutcome::Busy;
            }
            Err(AcquireError::Workspace(err)) => {
                return SubmitOutcome::Failure(receive_failure(&upload, err.into()));
            }
        };
        let request = match PublishRequest::store(&upload, self.uploads_dir.as_deref()) {
            Ok(request) => request,
            Err(err) => {
                return SubmitOutcome::Failure(receive_failure(&upload, err.into()));
            }
        };
        tracing::info!(
            name = %request.archive_name(),
            received_at = %request.received_at(),
            "Processing upload"
        );
        let outcome = match pipeline.run(&guard, &request) {
            Ok(result) => SubmitOutcome::Success(result),
            Err(failure) => SubmitOutcome::Failure(failure),
        };
        request.close();
        outcome
    }
}

fn receive_failure(upload: &Upload, err: Error) -> Failure {
    tracing::error!(name = %upload.file_name, error = %err, "Failed to receive upload");
    Failure {
        stage: Stage::Receive,
        error: err,
        stages: Vec::new(),
        narrative: String::new(),
    }
}

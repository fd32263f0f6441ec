//! HTTP surface: one upload endpoint and a health check.

use std::sync::Arc;

use axum::{
    Router,
    extract::{DefaultBodyLimit, Multipart, State, multipart::MultipartError},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::git::VersionControlClient;
use crate::pipeline::Upload;
use crate::service::{PublishService, SubmitOutcome};

/// Multipart field carrying the archive.
pub const UPLOAD_FIELD: &str = "sourceCodeZip";

/// Largest request body accepted on `/upload`.
pub const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

/// Build the router serving `service`.
pub fn router<C>(service: Arc<PublishService<C>>) -> Router
where
    C: VersionControlClient + 'static,
{
    Router::new()
        .route("/health", get(health))
        .route("/upload", post(upload::<C>))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(service)
        .layer(TraceLayer::new_for_http())
}

/// Serve `service` on `listener` until ctrl-c.
pub async fn serve<C>(
    listener: tokio::net::TcpListener,
    service: Arc<PublishService<C>>,
) -> std::io::Result<()>
where
    C: VersionControlClient + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Upload server listening at http://{addr}");
    }
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

impl IntoResponse for SubmitOutcome {
    fn into_response(self) -> Response {
        let status = match &self {
            SubmitOutcome::NoFileProvided => StatusCode::BAD_REQUEST,
            SubmitOutcome::ServerMisconfigured(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SubmitOutcome::Busy => StatusCode::CONFLICT,
            SubmitOutcome::Success(_) => StatusCode::OK,
            SubmitOutcome::Failure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.message()).into_response()
    }
}

/// POST /upload
async fn upload<C>(State(service): State<Arc<PublishService<C>>>, multipart: Multipart) -> Response
where
    C: VersionControlClient + 'static,
{
    let upload = match read_upload(multipart).await {
        Ok(upload) => upload,
        Err(err) => {
            tracing::warn!(error = %err, "Malformed upload request");
            return err.into_response();
        }
    };
    match tokio::task::spawn_blocking(move || service.submit(upload)).await {
        Ok(outcome) => outcome.into_response(),
        Err(err) => {
            tracing::error!(error = %err, "Publish task did not complete");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error processing file. The publish task was aborted.",
            )
                .into_response()
        }
    }
}

/// Pull the archive out of the form. Other fields are ignored.
async fn read_upload(mut multipart: Multipart) -> Result<Option<Upload>, MultipartError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let contents = field.bytes().await?;
        return Ok(Some(Upload::new(file_name, contents.to_vec())));
    }
    Ok(None)
}

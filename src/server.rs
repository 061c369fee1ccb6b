//! HTTP service: upload a batch, download its archive, inspect or purge it.
//!
//! | Method | Path | |
//! |--------|------|---|
//! | GET    | `/health` | liveness |
//! | POST   | `/api/convert` | multipart `files` (repeated), optional `quality`, `compression` |
//! | GET    | `/api/download/{task_id}` | the task's ZIP |
//! | GET    | `/api/tasks/{task_id}` | [`TaskStatus`] |
//! | DELETE | `/api/tasks/{task_id}` | purge, idempotent |
//!
//! Authentication is expected to live in front of this service.

use crate::batch::{BatchProcessor, BatchRequest, UploadedFile};
use crate::error::{ConvertError, ErrorKind};
use crate::output::BatchSummary;
use crate::store::{TaskStatus, TaskStore};
use axum::{
    extract::{multipart::Field, DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Prefix the download URL in a [`BatchSummary`] is built from.
pub const DOWNLOAD_PREFIX: &str = "/api/download";

/// Multipart overhead allowed on top of the configured file payload.
///
/// Bodies up to this limit are streamed; no single file holds more than
/// `max_file_size` bytes in memory.
const MULTIPART_SLACK: usize = 1024 * 1024;

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    processor: BatchProcessor,
}

impl AppState {
    pub fn new(processor: BatchProcessor) -> Self {
        Self { processor }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        self.processor.store()
    }
}

/// Error body of every non-2xx response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: ErrorKind,
}

/// Batch-fatal error mapped onto an HTTP status.
#[derive(Debug)]
pub struct AppError(ConvertError);

impl From<ConvertError> for AppError {
    fn from(err: ConvertError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::InvalidParameter => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Cancelled => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            kind,
        };
        (status, Json(body)).into_response()
    }
}

/// Build the application router.
pub fn app(state: AppState) -> Router {
    let config = state.processor.config();
    let body_limit = config
        .max_file_size
        .saturating_mul(config.max_batch_files)
        .saturating_add(MULTIPART_SLACK);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/convert", post(convert_batch))
        .route("/api/download/{task_id}", get(download_archive))
        .route("/api/tasks/{task_id}", get(task_status).delete(purge_task))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Liveness check.
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "jpgconv",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Convert an uploaded batch and return its summary.
///
/// The batch runs in its own task. If the client goes away the handler is
/// dropped, the guard cancels the batch, and that task still purges
/// whatever the batch wrote.
pub async fn convert_batch(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<BatchSummary>, AppError> {
    let max_file_size = state.processor.config().max_file_size;
    let request = read_batch_request(multipart, max_file_size).await?;
    info!("Received batch of {} file(s)", request.files.len());

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let processor = state.processor.clone();
    let worker = tokio::spawn(async move {
        let outcome = processor.process_with_cancel(request, cancel.clone()).await;
        if let Ok(task) = &outcome {
            if cancel.is_cancelled() {
                // Finished after the client left; nobody will fetch it.
                if let Err(e) = processor.store().purge(&task.task_id).await {
                    warn!("Task {}: purge after disconnect failed: {}", task.task_id, e);
                }
            }
        }
        outcome
    });
    let joined = worker.await;
    guard.disarm();

    let task = joined
        .map_err(|e| ConvertError::Internal(format!("batch worker failed: {e}")))??;
    Ok(Json(task.summary(DOWNLOAD_PREFIX)))
}

async fn read_batch_request(
    mut multipart: Multipart,
    max_file_size: usize,
) -> Result<BatchRequest, ConvertError> {
    let mut request = BatchRequest::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ConvertError::invalid_parameter("multipart", e.body_text()))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "files" | "files[]" => {
                let file = read_upload(field, max_file_size).await?;
                debug!("Upload field: {} ({} bytes)", file.filename, file.len());
                request.files.push(file);
            }
            "quality" | "compression" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ConvertError::invalid_parameter(&name, e.body_text()))?;
                let value = parse_integer(&name, &text)?;
                if name == "quality" {
                    request.quality = Some(value);
                } else {
                    request.compression = Some(value);
                }
            }
            other => debug!("Ignoring multipart field '{}'", other),
        }
    }

    Ok(request)
}

/// Read one file field chunk by chunk, keeping at most `max_len` bytes.
///
/// Past the ceiling the rest of the field is drained and dropped, and the
/// file is recorded as discarded so it fails with `FileTooLarge`.
async fn read_upload(mut field: Field<'_>, max_len: usize) -> Result<UploadedFile, ConvertError> {
    let filename = field.file_name().unwrap_or("upload").to_string();
    let mut bytes = Vec::new();
    let mut received = 0usize;

    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ConvertError::invalid_parameter("files", e.body_text()))?
    {
        received = received.saturating_add(chunk.len());
        if received > max_len {
            if !bytes.is_empty() {
                bytes = Vec::new();
            }
            continue;
        }
        bytes.extend_from_slice(&chunk);
    }

    if received > max_len {
        warn!(
            "Upload '{}' exceeds {} bytes ({} received), discarded",
            filename, max_len, received
        );
        return Ok(UploadedFile::discarded(filename, received));
    }
    Ok(UploadedFile::new(filename, bytes))
}

/// Integers only; out-of-range values are clamped later, never rejected.
fn parse_integer(name: &str, text: &str) -> Result<i64, ConvertError> {
    text.trim()
        .parse::<i64>()
        .map_err(|_| ConvertError::invalid_parameter(name, format!("'{text}' is not an integer")))
}

/// Stream back a task's archive.
pub async fn download_archive(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Response, AppError> {
    let bytes = state.store().read_archive(&task_id).await?;
    let disposition = format!("attachment; filename=\"converted_images_{task_id}.zip\"");
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

pub async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatus>, AppError> {
    let status = state.store().status(&task_id).await;
    if !status.exists {
        return Err(ConvertError::NotFound { task_id }.into());
    }
    Ok(Json(status))
}

pub async fn purge_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.store().purge(&task_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Periodically purge tasks older than `retention` until `shutdown` fires.
pub fn spawn_retention_sweeper(
    store: Arc<TaskStore>,
    retention: Duration,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = store.purge_expired(retention).await {
                        warn!("Retention sweep failed: {}", e);
                    }
                }
            }
        }
        debug!("Retention sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_integer_accepts_padded_numbers() {
        assert_eq!(parse_integer("quality", " 85 ").unwrap(), 85);
        assert_eq!(parse_integer("quality", "-5").unwrap(), -5);
    }

    #[test]
    fn parse_integer_rejects_non_integers() {
        for bad in ["high", "85.5", ""] {
            let err = parse_integer("quality", bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidParameter);
        }
    }

    #[test]
    fn error_statuses() {
        let status = |e: ConvertError| AppError(e).into_response().status();
        assert_eq!(
            status(ConvertError::invalid_parameter("files", "none")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(ConvertError::NotFound { task_id: "x".into() }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(ConvertError::Cancelled {
                task_id: "x".into(),
                reason: "timeout".into()
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status(ConvertError::Internal("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::new(dir.path()).unwrap());
        let shutdown = CancellationToken::new();
        let handle = spawn_retention_sweeper(
            store,
            Duration::from_secs(300),
            Duration::from_millis(10),
            shutdown.clone(),
        );
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper should stop")
            .unwrap();
    }
}

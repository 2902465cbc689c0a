//! Upload Routes
//!
//! HTTP endpoints for the resumable chunked upload protocol.
//!
//! Endpoints:
//! - POST /upload/initiate - Open a session
//! - POST /upload/chunk - Upload one chunk (multipart form)
//! - POST /upload/complete - Assemble the object
//! - GET /upload/status/:session_id - Which chunks the server holds
//! - POST /upload/cancel - Abort and forget a session

use axum::{
    extract::{rejection::JsonRejection, Multipart, Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::state::AppState;
use crate::upload::{
    ApiErrorBody, ApiResponse, CancelUploadRequest, CancelUploadResponse, ChunkUploadResponse,
    CompleteUploadRequest, CompleteUploadResponse, InitiateUploadRequest, InitiateUploadResponse,
    SessionStatusResponse, UploadError,
};

// ============================================================================
// Error Response
// ============================================================================

impl IntoResponse for UploadError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Upload request failed");
        } else {
            tracing::debug!(error = %self, "Upload request rejected");
        }

        let body = Json(ApiErrorBody {
            success: false,
            error: self.to_string(),
            code: self.code().to_string(),
        });

        (status, body).into_response()
    }
}

fn invalid_json(rejection: JsonRejection) -> UploadError {
    UploadError::Validation(rejection.body_text())
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/initiate", post(initiate))
        .route("/chunk", post(upload_chunk))
        .route("/complete", post(complete))
        .route("/status/:session_id", get(status))
        .route("/cancel", post(cancel))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /upload/initiate
async fn initiate(
    State(state): State<AppState>,
    payload: Result<Json<InitiateUploadRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<InitiateUploadResponse>>, UploadError> {
    let Json(request) = payload.map_err(invalid_json)?;
    let session = state.sessions().initiate(request).await?;

    Ok(Json(ApiResponse::ok(InitiateUploadResponse {
        session_id: session.id,
        file_name: session.file_name,
        total_chunks: session.total_chunks,
        chunk_size: session.chunk_size,
        expires_at: session.expires_at,
    })))
}

/// POST /upload/chunk
///
/// Form fields: `sessionId`, `chunkIndex` (0-based), `totalChunks`, `file`.
async fn upload_chunk(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ApiResponse<ChunkUploadResponse>>, UploadError> {
    let mut session_id = None;
    let mut chunk_index = None;
    let mut total_chunks = None;
    let mut file = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| UploadError::Validation(format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let read_err = |e: axum::extract::multipart::MultipartError| {
            UploadError::Validation(format!("Failed to read field {}: {}", name, e))
        };

        match name.as_str() {
            "sessionId" => session_id = Some(field.text().await.map_err(read_err)?),
            "chunkIndex" => chunk_index = Some(field.text().await.map_err(read_err)?),
            "totalChunks" => total_chunks = Some(field.text().await.map_err(read_err)?),
            "file" => file = Some(field.bytes().await.map_err(read_err)?),
            _ => {}
        }
    }

    let session_id = session_id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let (session_id, chunk_index, total_chunks, file) =
        match (session_id, chunk_index, total_chunks, file) {
            (Some(session_id), Some(chunk_index), Some(total_chunks), Some(file)) => {
                (session_id, chunk_index, total_chunks, file)
            }
            (session_id, chunk_index, total_chunks, file) => {
                let missing: Vec<&str> = [
                    ("sessionId", session_id.is_none()),
                    ("chunkIndex", chunk_index.is_none()),
                    ("totalChunks", total_chunks.is_none()),
                    ("file", file.is_none()),
                ]
                .into_iter()
                .filter(|(_, absent)| *absent)
                .map(|(name, _)| name)
                .collect();
                return Err(UploadError::Validation(format!(
                    "Missing required fields: {}",
                    missing.join(", ")
                )));
            }
        };

    let chunk_index: usize = chunk_index
        .trim()
        .parse()
        .map_err(|_| UploadError::Validation(format!("Invalid chunkIndex: {}", chunk_index)))?;
    let total_chunks: usize = total_chunks
        .trim()
        .parse()
        .map_err(|_| UploadError::Validation(format!("Invalid totalChunks: {}", total_chunks)))?;
    let part_number = u32::try_from(chunk_index + 1)
        .map_err(|_| UploadError::Validation(format!("Invalid chunkIndex: {}", chunk_index)))?;

    let completion_tag = state
        .sessions()
        .accept_chunk(&session_id, part_number, file)
        .await?;

    tracing::debug!(
        session_id = %session_id,
        chunk_index,
        total_chunks,
        "Chunk uploaded"
    );

    Ok(Json(ApiResponse::ok(ChunkUploadResponse {
        chunk_index,
        session_id,
        part_number,
        completion_tag,
    })))
}

/// POST /upload/complete
///
/// Idempotent: a completed session answers with its recorded location.
async fn complete(
    State(state): State<AppState>,
    payload: Result<Json<CompleteUploadRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<CompleteUploadResponse>>, UploadError> {
    let Json(request) = payload.map_err(invalid_json)?;
    if request.session_id.trim().is_empty() {
        return Err(UploadError::Validation("sessionId is required".to_string()));
    }

    let done = state.sessions().complete(request.session_id.trim()).await?;

    if let Some(expected) = request.total_chunks {
        tracing::debug!(session_id = %done.session_id, expected, "Client chunk count on complete");
    }

    Ok(Json(ApiResponse::ok(done.into())))
}

/// GET /upload/status/:session_id
async fn status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ApiResponse<SessionStatusResponse>>, UploadError> {
    let session = state
        .sessions()
        .get_status(&session_id)
        .await
        .ok_or_else(|| UploadError::SessionNotFound(session_id.clone()))?;

    Ok(Json(ApiResponse::ok(session.status_response())))
}

/// POST /upload/cancel
async fn cancel(
    State(state): State<AppState>,
    payload: Result<Json<CancelUploadRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<CancelUploadResponse>>, UploadError> {
    let Json(request) = payload.map_err(invalid_json)?;
    if request.session_id.trim().is_empty() {
        return Err(UploadError::Validation("sessionId is required".to_string()));
    }

    state.sessions().cancel(request.session_id.trim()).await?;

    Ok(Json(ApiResponse::ok(CancelUploadResponse {
        session_id: request.session_id.trim().to_string(),
        message: "Upload cancelled".to_string(),
    })))
}

//! Session API as seen by the upload controller
//!
//! [`HttpUploadApi`] talks to a remote server over the JSON/multipart HTTP
//! surface. [`SessionService`] implements the same trait directly, for
//! clients embedded in the server process.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::upload::{
    ApiErrorBody, ApiResponse, CancelUploadRequest, ChunkUploadResponse, CompleteUploadRequest,
    CompleteUploadResponse, InitiateUploadRequest, InitiateUploadResponse, SessionService,
    SessionStatusResponse, UploadError, DEFAULT_REQUEST_TIMEOUT_SECS,
};

use super::types::ClientError;

/// Operations the controller needs from the session service
#[async_trait]
pub trait UploadApi: Send + Sync {
    async fn initiate(&self, request: &InitiateUploadRequest) -> Result<InitiateUploadResponse, ClientError>;

    /// Upload chunk `chunk_index` (0-based)
    async fn upload_chunk(
        &self,
        session_id: &str,
        chunk_index: usize,
        total_chunks: usize,
        data: Bytes,
    ) -> Result<ChunkUploadResponse, ClientError>;

    /// Server view of a session; [`ClientError::NotFound`] once it is gone
    async fn status(&self, session_id: &str) -> Result<SessionStatusResponse, ClientError>;

    async fn complete(&self, request: &CompleteUploadRequest) -> Result<CompleteUploadResponse, ClientError>;

    async fn cancel(&self, session_id: &str) -> Result<(), ClientError>;
}

// ============================================================================
// HTTP
// ============================================================================

/// Client for the `/upload/*` HTTP endpoints
#[derive(Clone)]
pub struct HttpUploadApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUploadApi {
    /// `base_url` is the server root, e.g. `http://localhost:3000`
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    /// Every request, body included, is abandoned after `timeout`; a timed-out
    /// chunk counts as a failed attempt.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10).min(timeout))
            .timeout(timeout)
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/upload/{}", self.base_url, path)
    }
}

/// Unwrap the `{success, data}` envelope or turn the error envelope into a [`ClientError`]
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        let body: ApiResponse<T> = response.json().await?;
        return Ok(body.data);
    }

    let text = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ApiErrorBody>(&text) {
        Ok(body) => (body.code, body.error),
        Err(_) => ("HTTP_ERROR".to_string(), text),
    };

    if status == StatusCode::NOT_FOUND {
        return Err(ClientError::NotFound(message));
    }
    Err(ClientError::Server {
        status: status.as_u16(),
        code,
        message,
    })
}

#[async_trait]
impl UploadApi for HttpUploadApi {
    async fn initiate(&self, request: &InitiateUploadRequest) -> Result<InitiateUploadResponse, ClientError> {
        let response = self
            .client
            .post(self.url("initiate"))
            .json(request)
            .send()
            .await?;
        decode(response).await
    }

    async fn upload_chunk(
        &self,
        session_id: &str,
        chunk_index: usize,
        total_chunks: usize,
        data: Bytes,
    ) -> Result<ChunkUploadResponse, ClientError> {
        let file = Part::stream(data)
            .file_name(format!("chunk-{}", chunk_index))
            .mime_str("application/octet-stream")?;

        let form = Form::new()
            .text("sessionId", session_id.to_string())
            .text("chunkIndex", chunk_index.to_string())
            .text("totalChunks", total_chunks.to_string())
            .part("file", file);

        let response = self
            .client
            .post(self.url("chunk"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ClientError::ChunkUpload(e.to_string()))?;
        decode(response).await
    }

    async fn status(&self, session_id: &str) -> Result<SessionStatusResponse, ClientError> {
        let url = self.url(&format!("status/{}", urlencoding::encode(session_id)));
        let response = self.client.get(url).send().await?;
        decode(response).await
    }

    async fn complete(&self, request: &CompleteUploadRequest) -> Result<CompleteUploadResponse, ClientError> {
        let response = self
            .client
            .post(self.url("complete"))
            .json(request)
            .send()
            .await?;
        decode(response).await
    }

    async fn cancel(&self, session_id: &str) -> Result<(), ClientError> {
        let response = self
            .client
            .post(self.url("cancel"))
            .json(&CancelUploadRequest {
                session_id: session_id.to_string(),
            })
            .send()
            .await?;
        decode::<serde_json::Value>(response).await.map(|_| ())
    }
}

// ============================================================================
// In-process
// ============================================================================

impl From<UploadError> for ClientError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::SessionNotFound(id) => ClientError::NotFound(id),
            other => ClientError::Server {
                status: other.status_code().as_u16(),
                code: other.code().to_string(),
                message: other.to_string(),
            },
        }
    }
}

#[async_trait]
impl UploadApi for SessionService {
    async fn initiate(&self, request: &InitiateUploadRequest) -> Result<InitiateUploadResponse, ClientError> {
        let session = SessionService::initiate(self, request.clone()).await?;
        Ok(InitiateUploadResponse {
            session_id: session.id,
            file_name: session.file_name,
            total_chunks: session.total_chunks,
            chunk_size: session.chunk_size,
            expires_at: session.expires_at,
        })
    }

    async fn upload_chunk(
        &self,
        session_id: &str,
        chunk_index: usize,
        _total_chunks: usize,
        data: Bytes,
    ) -> Result<ChunkUploadResponse, ClientError> {
        let part_number = u32::try_from(chunk_index + 1)
            .map_err(|_| ClientError::Validation(format!("chunk index {} too large", chunk_index)))?;
        let completion_tag = self.accept_chunk(session_id, part_number, data).await?;

        Ok(ChunkUploadResponse {
            chunk_index,
            session_id: session_id.to_string(),
            part_number,
            completion_tag,
        })
    }

    async fn status(&self, session_id: &str) -> Result<SessionStatusResponse, ClientError> {
        self.get_status(session_id)
            .await
            .map(|session| session.status_response())
            .ok_or_else(|| ClientError::NotFound(session_id.to_string()))
    }

    async fn complete(&self, request: &CompleteUploadRequest) -> Result<CompleteUploadResponse, ClientError> {
        let done = SessionService::complete(self, &request.session_id).await?;
        Ok(done.into())
    }

    async fn cancel(&self, session_id: &str) -> Result<(), ClientError> {
        SessionService::cancel(self, session_id).await?;
        Ok(())
    }
}

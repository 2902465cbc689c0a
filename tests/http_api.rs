//! Router-level tests for the `/upload/*` endpoints

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use resumable_upload_server::config::Config;
use resumable_upload_server::routes;
use resumable_upload_server::state::AppState;
use resumable_upload_server::storage::MemoryStorage;
use resumable_upload_server::upload::{SessionService, SessionSettings};

const BOUNDARY: &str = "test-boundary-7f3a";

fn test_app() -> (Router, MemoryStorage) {
    let storage = MemoryStorage::new("test", 4);
    let settings = SessionSettings {
        default_chunk_size: 4,
        min_chunk_size: 4,
        ..SessionSettings::default()
    };
    let sessions = SessionService::new(Arc::new(storage.clone()), settings);
    (routes::app(AppState::new(Config::default(), sessions)), storage)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Multipart chunk request; `None` values leave the field out
fn chunk_request(session_id: Option<&str>, chunk_index: Option<usize>, data: Option<&[u8]>) -> Request<Body> {
    let mut body = Vec::new();
    let mut text_field = |name: &str, value: String| {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                BOUNDARY, name, value
            )
            .as_bytes(),
        );
    };

    if let Some(id) = session_id {
        text_field("sessionId", id.to_string());
    }
    if let Some(index) = chunk_index {
        text_field("chunkIndex", index.to_string());
    }
    text_field("totalChunks", "3".to_string());

    if let Some(data) = data {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"chunk\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                BOUNDARY
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

    Request::builder()
        .method(Method::POST)
        .uri("/upload/chunk")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn initiate(app: &Router, file_size: u64) -> String {
    let (status, body) = send(
        app,
        post_json(
            "/upload/initiate",
            json!({ "fileName": "notes.txt", "fileSize": file_size, "fileType": "text/plain" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["data"]["sessionId"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health() {
    let (app, _) = test_app();
    let (status, body) = send(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_initiate_envelope() {
    let (app, storage) = test_app();
    let (status, body) = send(
        &app,
        post_json(
            "/upload/initiate",
            json!({ "fileName": "notes.txt", "fileSize": 10, "fileType": "text/plain" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["fileName"], "notes.txt");
    assert_eq!(body["data"]["totalChunks"], 3);
    assert_eq!(body["data"]["chunkSize"], 4);
    assert!(body["data"]["expiresAt"].is_string());
    assert_eq!(storage.pending_upload_count().await, 1);
}

#[tokio::test]
async fn test_initiate_rejects_bad_input() {
    let (app, _) = test_app();

    let (status, body) = send(
        &app,
        post_json(
            "/upload/initiate",
            json!({ "fileName": "", "fileSize": 10, "fileType": "text/plain" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let (status, body) = send(&app, post_json("/upload/initiate", json!({ "fileSize": 10 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_full_protocol_over_router() {
    let (app, storage) = test_app();
    let session_id = initiate(&app, 10).await;

    // Out of order, with one duplicate.
    for (index, data) in [(2usize, &b"89"[..]), (0, b"0123"), (1, b"4567"), (1, b"4567")] {
        let (status, body) = send(&app, chunk_request(Some(&session_id), Some(index), Some(data))).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["data"]["partNumber"], index + 1);
    }

    let (status, body) = send(&app, get(&format!("/upload/status/{}", session_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["uploadedChunkIndices"], json!([0, 1, 2]));
    assert_eq!(body["data"]["status"], "uploading");

    let complete = json!({ "sessionId": session_id, "totalChunks": 3 });
    let (status, first) = send(&app, post_json("/upload/complete", complete.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let (status, second) = send(&app, post_json("/upload/complete", complete)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["data"]["location"], second["data"]["location"]);
    assert_eq!(storage.call_counts().complete, 1);

    let location = first["data"]["location"].as_str().unwrap();
    let key = location.trim_start_matches("memory://test/");
    assert_eq!(&storage.object(key).await.unwrap().data[..], b"0123456789");

    // Chunks after completion are refused.
    let (status, body) = send(&app, chunk_request(Some(&session_id), Some(0), Some(b"0123"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "SESSION_ALREADY_COMPLETED");

    // Completed sessions cannot be cancelled.
    let (status, body) = send(&app, post_json("/upload/cancel", json!({ "sessionId": session_id }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "CANNOT_CANCEL_COMPLETED");
}

#[tokio::test]
async fn test_chunk_missing_fields() {
    let (app, _) = test_app();
    let (status, body) = send(&app, chunk_request(None, Some(0), None)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let message = body["error"].as_str().unwrap();
    assert!(message.contains("sessionId"));
    assert!(message.contains("file"));
    assert!(!message.contains("chunkIndex"));
}

#[tokio::test]
async fn test_chunk_blank_session_id_is_missing() {
    let (app, _) = test_app();
    let (status, body) = send(&app, chunk_request(Some("   "), None, Some(b"0123"))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
    let message = body["error"].as_str().unwrap();
    assert!(message.contains("Missing required fields"));
    assert!(message.contains("sessionId"));
    assert!(message.contains("chunkIndex"));
    assert!(!message.contains("totalChunks"));
    assert!(!message.contains("file"));
}

#[tokio::test]
async fn test_chunk_out_of_range() {
    let (app, _) = test_app();
    let session_id = initiate(&app, 10).await;

    let (status, body) = send(&app, chunk_request(Some(&session_id), Some(3), Some(b"xx"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_PART_NUMBER");
}

#[tokio::test]
async fn test_complete_incomplete_upload() {
    let (app, _) = test_app();
    let session_id = initiate(&app, 10).await;
    send(&app, chunk_request(Some(&session_id), Some(0), Some(b"0123"))).await;

    let (status, body) = send(&app, post_json("/upload/complete", json!({ "sessionId": session_id }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INCOMPLETE_UPLOAD");
}

#[tokio::test]
async fn test_unknown_session() {
    let (app, _) = test_app();

    let (status, body) = send(&app, get("/upload/status/does-not-exist")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "SESSION_NOT_FOUND");

    let (status, _) = send(&app, chunk_request(Some("does-not-exist"), Some(0), Some(b"0123"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_forgets_session() {
    let (app, storage) = test_app();
    let session_id = initiate(&app, 10).await;
    send(&app, chunk_request(Some(&session_id), Some(0), Some(b"0123"))).await;

    let (status, body) = send(&app, post_json("/upload/cancel", json!({ "sessionId": session_id }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["sessionId"], session_id.as_str());
    assert_eq!(storage.call_counts().abort, 1);
    assert_eq!(storage.pending_upload_count().await, 0);

    let (status, _) = send(&app, get(&format!("/upload/status/{}", session_id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

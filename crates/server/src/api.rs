// Auxiliary HTTP endpoints.

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use docsync_common::name::is_valid_file_name;
use serde::Deserialize;
use tracing::{error, info};

use crate::engine::Replica;
use crate::error::PersistenceError;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyFileRequest {
    pub source_file: String,
    pub target_file: String,
    #[serde(default)]
    pub security_key: Option<String>,
}

// ── Error ──────────────────────────────────────────────────────────

/// Rejections of `POST /copyFile`, each mapped to a status and a plain-text body.
#[derive(Debug)]
pub enum CopyFileError {
    Unauthorized,
    InvalidSourceName,
    InvalidTargetName,
    SourceMissing,
    TargetExists,
    Storage(PersistenceError),
    CorruptState { name: String, error: anyhow::Error },
}

impl CopyFileError {
    /// Label for the `docsync_copy_file_total` counter.
    pub fn result_label(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::InvalidSourceName => "invalid-source-file-name",
            Self::InvalidTargetName => "invalid-target-file-name",
            Self::SourceMissing => "source-file-doesnt-exist",
            Self::TargetExists => "target-file-already-exists",
            Self::Storage(_) | Self::CorruptState { .. } => "internal-error",
        }
    }
}

impl From<PersistenceError> for CopyFileError {
    fn from(source: PersistenceError) -> Self {
        Self::Storage(source)
    }
}

impl IntoResponse for CopyFileError {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
            Self::InvalidSourceName => {
                (StatusCode::BAD_REQUEST, "Invalid source file name").into_response()
            }
            Self::InvalidTargetName => {
                (StatusCode::BAD_REQUEST, "Invalid target file name").into_response()
            }
            Self::SourceMissing => {
                (StatusCode::BAD_REQUEST, "Source file doesn't exist").into_response()
            }
            Self::TargetExists => {
                (StatusCode::BAD_REQUEST, "Target document already exists").into_response()
            }
            Self::Storage(error) => {
                error!(%error, "copy file storage error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
            }
            Self::CorruptState { name, error } => {
                error!(doc = %name, error = %format!("{error:#}"), "stored document is corrupt");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
            }
        }
    }
}

// ── Handlers ───────────────────────────────────────────────────────

/// Copy the stored state of one document to a name that has never been
/// initialized. Works on persisted state only, so unsaved edits of a live
/// source are not included.
pub async fn copy_file(
    State(state): State<AppState>,
    Json(request): Json<CopyFileRequest>,
) -> Result<(StatusCode, &'static str), CopyFileError> {
    let result = copy_stored_document(&state, &request).await;
    let label = match &result {
        Ok(()) => "ok",
        Err(error) => error.result_label(),
    };
    state.metrics.increment_copy_file(label);

    result?;
    info!(source = %request.source_file, target = %request.target_file, "copied document");
    Ok((StatusCode::OK, "OK"))
}

async fn copy_stored_document(
    state: &AppState,
    request: &CopyFileRequest,
) -> Result<(), CopyFileError> {
    if !state.config.security_key_accepts(request.security_key.as_deref()) {
        return Err(CopyFileError::Unauthorized);
    }
    if !is_valid_file_name(&request.source_file) {
        return Err(CopyFileError::InvalidSourceName);
    }
    if !is_valid_file_name(&request.target_file) {
        return Err(CopyFileError::InvalidTargetName);
    }

    let source = load_replica(state, &request.source_file).await?;
    if !source.is_initialized() {
        return Err(CopyFileError::SourceMissing);
    }

    let target = load_replica(state, &request.target_file).await?;
    if target.is_initialized() {
        return Err(CopyFileError::TargetExists);
    }

    state.hub.store().store(&request.target_file, &source.encode_state()).await?;
    Ok(())
}

async fn load_replica(state: &AppState, name: &str) -> Result<Replica, CopyFileError> {
    let replica = Replica::new(state.config.session.gc_enabled);
    if let Some(stored) = state.hub.store().load(name).await? {
        replica
            .merge(&stored)
            .map_err(|error| CopyFileError::CorruptState { name: name.to_string(), error })?;
    }
    Ok(replica)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
        Router,
    };
    use tower::ServiceExt;

    use crate::config::ServerConfig;
    use crate::engine::Replica;
    use crate::metrics::HubMetrics;
    use crate::persistence::MemoryDocStore;
    use crate::{build_router, AppState};

    const SECRET: &str = "s3cret";

    fn seeded_state() -> Vec<u8> {
        let replica = Replica::new(true);
        replica.seed("int main() {}\n");
        replica.encode_state()
    }

    fn test_app(require_key: bool) -> (Router, Arc<MemoryDocStore>, Arc<HubMetrics>) {
        let store = Arc::new(MemoryDocStore::new());
        store.insert("abc.cpp", seeded_state());
        store.insert("taken.cpp", seeded_state());

        let config = ServerConfig {
            security_key: Some(SECRET.to_string()),
            require_security_key: require_key,
            ..ServerConfig::default()
        };
        let state = AppState::new(store.clone(), config);
        let metrics = Arc::clone(&state.metrics);
        (build_router(state), store, metrics)
    }

    fn copy_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/copyFile")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("copy request should build")
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("body should be readable");
        String::from_utf8(bytes.to_vec()).expect("body should be utf-8")
    }

    #[tokio::test]
    async fn copies_initialized_source_to_fresh_target() {
        let (app, store, metrics) = test_app(true);

        let response = app
            .oneshot(copy_request(serde_json::json!({
                "sourceFile": "abc.cpp",
                "targetFile": "copy.cpp",
                "securityKey": SECRET,
            })))
            .await
            .expect("copy should respond");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "OK");

        let copied = Replica::new(true);
        copied.merge(&store.get("copy.cpp").expect("target stored")).expect("target merges");
        assert!(copied.is_initialized());
        assert!(metrics.render_prometheus().contains("docsync_copy_file_total{result=\"ok\"} 1"));
    }

    #[tokio::test]
    async fn wrong_key_is_unauthorized_when_required() {
        let (app, store, _) = test_app(true);

        let response = app
            .oneshot(copy_request(serde_json::json!({
                "sourceFile": "abc.cpp",
                "targetFile": "copy.cpp",
                "securityKey": "nope",
            })))
            .await
            .expect("copy should respond");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(store.get("copy.cpp"), None);
    }

    #[tokio::test]
    async fn key_is_ignored_when_not_required() {
        let (app, _, _) = test_app(false);

        let response = app
            .oneshot(copy_request(serde_json::json!({
                "sourceFile": "abc.cpp",
                "targetFile": "copy.cpp",
            })))
            .await
            .expect("copy should respond");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rejects_invalid_names() {
        let (app, _, _) = test_app(false);

        let response = app
            .clone()
            .oneshot(copy_request(serde_json::json!({
                "sourceFile": "../etc/passwd",
                "targetFile": "copy.cpp",
            })))
            .await
            .expect("copy should respond");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "Invalid source file name");

        let response = app
            .oneshot(copy_request(serde_json::json!({
                "sourceFile": "abc.cpp",
                "targetFile": "has space.cpp",
            })))
            .await
            .expect("copy should respond");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "Invalid target file name");
    }

    #[tokio::test]
    async fn missing_source_and_existing_target_are_rejected() {
        let (app, _, metrics) = test_app(false);

        let response = app
            .clone()
            .oneshot(copy_request(serde_json::json!({
                "sourceFile": "missing.cpp",
                "targetFile": "copy.cpp",
            })))
            .await
            .expect("copy should respond");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "Source file doesn't exist");

        let response = app
            .oneshot(copy_request(serde_json::json!({
                "sourceFile": "abc.cpp",
                "targetFile": "taken.cpp",
            })))
            .await
            .expect("copy should respond");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "Target document already exists");

        let rendered = metrics.render_prometheus();
        assert!(
            rendered.contains("docsync_copy_file_total{result=\"source-file-doesnt-exist\"} 1")
        );
        assert!(
            rendered.contains("docsync_copy_file_total{result=\"target-file-already-exists\"} 1")
        );
    }
}

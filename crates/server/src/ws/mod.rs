pub mod connection;

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
};
use docsync_common::name::doc_name_from_path;
use futures_util::StreamExt;

use crate::AppState;

pub use connection::{run_connection, CloseReason};

/// Upgrade handler for `GET /{*doc}`. The document name is the request path
/// without its leading `/`.
pub async fn ws_route(State(state): State<AppState>, uri: Uri, ws: WebSocketUpgrade) -> Response {
    let Some(name) = doc_name_from_path(uri.path()) else {
        return (StatusCode::BAD_REQUEST, "missing document name").into_response();
    };
    let name = name.to_string();
    let hub = Arc::clone(&state.hub);

    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        run_connection(hub, name, sink, stream).await;
    })
}

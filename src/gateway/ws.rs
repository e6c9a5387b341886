//! Streaming read endpoint: `WS /nds/ws/read/{client_id}`.
//!
//! Protocol, in order:
//! 1. the client sends one text frame with the same JSON body as
//!    `POST /nds/read`
//! 2. the server answers with zero or more binary frames of at most 512 KiB
//! 3. a text trailer `{"end_of_file": true}` closes a successful transfer
//!
//! On failure the client receives one text frame `{"code", "message"}`
//! (403 unconfigured, 404 missing file, 500 otherwise) and the socket
//! closes. Chunk boundaries carry no meaning; clients reassemble until the
//! trailer.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::ErrorKind;

use super::{GatewayState, ReadRequest};

/// Frame payload bound for binary chunks.
pub const CHUNK_SIZE: usize = 512 * 1024;

pub async fn read_socket(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    ws.on_upgrade(move |socket| serve_read(socket, state, client_id))
}

async fn serve_read(mut socket: WebSocket, state: Arc<GatewayState>, client_id: String) {
    let request = match receive_request(&mut socket).await {
        Some(request) => request,
        None => return,
    };

    debug!(
        client_id,
        nds_id = request.nds_id,
        path = %request.file_path,
        offset = request.header_offset,
        "ws read"
    );

    match fetch(&state, &request).await {
        Ok(content) => {
            for chunk in content.chunks(CHUNK_SIZE) {
                if socket.send(Message::Binary(chunk.to_vec())).await.is_err() {
                    // Client went away; the pool connection was already
                    // released by fetch().
                    return;
                }
            }
            let trailer = json!({ "end_of_file": true }).to_string();
            let _ = socket.send(Message::Text(trailer)).await;
        }
        Err((code, message)) => {
            warn!(client_id, code, "ws read failed: {message}");
            let frame = json!({ "code": code, "message": message }).to_string();
            let _ = socket.send(Message::Text(frame)).await;
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

/// Wait for the single request frame; ping/pong are handled by axum.
async fn receive_request(socket: &mut WebSocket) -> Option<ReadRequest> {
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(text) => match serde_json::from_str(&text) {
                Ok(request) => return Some(request),
                Err(e) => {
                    let frame = json!({ "code": 400, "message": format!("bad request: {e}") });
                    let _ = socket.send(Message::Text(frame.to_string())).await;
                    return None;
                }
            },
            Message::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

/// Acquire, read the requested range, release. Errors are mapped to the
/// wire codes the worker switches on.
async fn fetch(state: &GatewayState, request: &ReadRequest) -> Result<Vec<u8>, (u16, String)> {
    if !state.pools.contains(request.nds_id).await {
        return Err((403, format!("NDS {} is not configured", request.nds_id)));
    }

    let mut session = state
        .pools
        .acquire(request.nds_id)
        .await
        .map_err(|e| (error_code(&e.kind), e.to_string()))?;

    let content = session
        .read_range(&request.file_path, request.header_offset, request.compress_size)
        .await;
    match content {
        Ok(content) => {
            session.release().await;
            Ok(content)
        }
        Err(err) => {
            let code = error_code(&err.kind);
            if err.is_missing() {
                session.release().await;
            } else {
                session.discard().await;
            }
            Err((code, err.to_string()))
        }
    }
}

fn error_code(kind: &ErrorKind) -> u16 {
    match kind {
        ErrorKind::NotConfigured => 403,
        ErrorKind::SourceMissing => 404,
        _ => 500,
    }
}

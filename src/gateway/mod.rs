//! NDS gateway service.
//!
//! A stateless frontend multiplexing many callers onto the per-NDS
//! connection pools. Scanners use it to list and to parse central
//! directories; workers stream member bytes through it; operators mutate
//! the pool map and probe credentials.
//!
//! All routes live under `/nds`; see [`api`] for the JSON surface and
//! [`ws`] for the streaming read endpoint.

pub mod api;
pub mod client;
pub mod ws;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::backend::BackendClient;
use crate::error::Result;
use crate::pool::{PoolMap, PoolSettings};

/// Shared state behind every gateway handler.
pub struct GatewayState {
    pub pools: Arc<PoolMap>,
    pub backend: BackendClient,
}

/// Body of `POST /nds/read` and of the one request frame on `ws/read`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadRequest {
    #[serde(rename = "NDSID")]
    pub nds_id: i64,
    #[serde(rename = "FilePath")]
    pub file_path: String,
    /// Byte offset to start at; the member's payload offset for ranged reads.
    #[serde(rename = "HeaderOffset", default)]
    pub header_offset: u64,
    /// Bytes to read; whole remainder of the file when absent.
    #[serde(rename = "CompressSize", default)]
    pub compress_size: Option<u64>,
}

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/nds/update-pool", post(api::update_pool))
        .route("/nds/scan", post(api::scan))
        .route("/nds/zip-info", post(api::zip_info))
        .route("/nds/read", post(api::read))
        .route("/nds/status", get(api::status))
        .route("/nds/check", post(api::check))
        .route("/nds/ws/read/:client_id", get(ws::read_socket))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Pre-populate the pool map with every enabled NDS the store knows about.
pub async fn bootstrap_pools(state: &GatewayState) -> Result<()> {
    let configs = state.backend.nds_list().await?;
    let mut added = 0usize;
    for config in configs.iter().filter(|config| config.enabled()) {
        state.pools.upsert(config.id, PoolSettings::from(config)).await;
        added += 1;
    }
    info!(added, "gateway pools bootstrapped");
    Ok(())
}

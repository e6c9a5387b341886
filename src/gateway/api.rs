//! Gateway JSON endpoints.
//!
//! Status mapping: `NotConfigured` → 403, `SourceMissing` → 404, everything
//! else that escapes a handler → 500 with the error text in the body. One
//! failing archive inside a `zip-info` batch is reported per path and never
//! fails the batch.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::error::{ErrorKind, NdsError};
use crate::nds::{NdsClient, NdsConfig, SessionParams};
use crate::pool::{PoolSettings, PoolStatus};
use crate::zip::MemberInfo;

use super::{GatewayState, ReadRequest};

/// Error wrapper giving every handler one `?`-friendly exit path.
pub struct ApiError(NdsError);

impl From<NdsError> for ApiError {
    fn from(err: NdsError) -> Self {
        Self(err.report())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::NotConfigured => StatusCode::FORBIDDEN,
            ErrorKind::SourceMissing => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.message).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolAction {
    Add,
    Update,
    Remove,
}

#[derive(Deserialize)]
pub struct UpdatePoolRequest {
    pub action: PoolAction,
    /// Full config for add/update; only `ID` is read for remove.
    pub config: serde_json::Value,
}

#[derive(Deserialize)]
struct ConfigId {
    #[serde(rename = "ID")]
    id: i64,
}

/// `POST /nds/update-pool`: mutate the pool map.
///
/// `remove` of an absent id is not an error; `add`/`update` with `Switch=0`
/// behaves as remove so a disabled NDS drops out of the data path at once.
pub async fn update_pool(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<UpdatePoolRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match request.action {
        PoolAction::Remove => {
            let ConfigId { id } = parse_config(&request.config)?;
            state.pools.remove(id).await;
            Ok(Json(json!({ "message": "Server removed" })))
        }
        PoolAction::Add | PoolAction::Update => {
            let config: NdsConfig = parse_config(&request.config)?;
            if !config.enabled() {
                state.pools.remove(config.id).await;
                return Ok(Json(json!({ "message": "Server removed due to Switch off" })));
            }
            state.pools.upsert(config.id, PoolSettings::from(&config)).await;
            info!(nds_id = config.id, "pool configuration applied");
            Ok(Json(json!({ "message": "Server updated" })))
        }
    }
}

fn parse_config<T: serde::de::DeserializeOwned>(value: &serde_json::Value) -> Result<T, ApiError> {
    serde_json::from_value(value.clone())
        .map_err(|e| ApiError(NdsError::parse("gateway.api", format!("bad config: {e}"))))
}

#[derive(Deserialize)]
pub struct ScanRequest {
    pub nds_id: i64,
    pub scan_path: String,
    #[serde(default)]
    pub filter_pattern: Option<String>,
}

/// `POST /nds/scan`: recursive listing over one pooled connection.
pub async fn scan(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<ScanRequest>,
) -> Result<Json<Vec<String>>, ApiError> {
    let mut session = state.pools.acquire(request.nds_id).await?;
    let listed = session
        .list_recursive(&request.scan_path, request.filter_pattern.as_deref())
        .await;
    match listed {
        Ok(files) => {
            session.release().await;
            Ok(Json(files))
        }
        Err(err) => {
            session.discard().await;
            Err(err.into())
        }
    }
}

#[derive(Deserialize)]
pub struct ZipInfoRequest {
    pub nds_id: i64,
    pub file_paths: Vec<String>,
}

/// Per-path outcome inside a `zip-info` batch.
#[derive(Debug, Serialize, Deserialize)]
pub struct ZipInfoEntry {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<Vec<MemberInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /nds/zip-info`: central-directory parse for a batch of archives.
///
/// The batch shares one pooled connection; archives are visited
/// sequentially and each reports success or error independently.
pub async fn zip_info(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<ZipInfoRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut session = state.pools.acquire(request.nds_id).await?;
    let mut results: HashMap<String, ZipInfoEntry> = HashMap::new();

    for path in &request.file_paths {
        match session.parse_zip_central_directory(path).await {
            Ok(info) => {
                results.insert(
                    path.clone(),
                    ZipInfoEntry { status: "success".into(), info: Some(info), error: None },
                );
            }
            Err(err) => {
                warn!(nds_id = request.nds_id, path, "zip-info failed: {err}");
                results.insert(
                    path.clone(),
                    ZipInfoEntry { status: "error".into(), info: None, error: Some(err.to_string()) },
                );
            }
        }
    }

    session.release().await;
    Ok(Json(json!({ "code": 200, "data": results })))
}

/// `POST /nds/read`: bulk ranged read as an octet-stream response.
pub async fn read(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<ReadRequest>,
) -> Result<Response, ApiError> {
    if !state.pools.contains(request.nds_id).await {
        return Err(NdsError::not_configured("gateway.api", request.nds_id).into());
    }

    let mut session = state.pools.acquire(request.nds_id).await?;
    let content = session
        .read_range(&request.file_path, request.header_offset, request.compress_size)
        .await;
    match content {
        Ok(content) => {
            session.release().await;
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
            if let Ok(size) = HeaderValue::from_str(&content.len().to_string()) {
                headers.insert("X-File-Size", size);
            }
            Ok((StatusCode::OK, headers, content).into_response())
        }
        Err(err) => {
            if err.is_missing() {
                session.release().await;
            } else {
                session.discard().await;
            }
            Err(err.into())
        }
    }
}

/// `GET /nds/status`: pool counters per NDS.
pub async fn status(State(state): State<Arc<GatewayState>>) -> Json<HashMap<i64, PoolStatus>> {
    Json(state.pools.status().await)
}

/// `POST /nds/check`: probe credentials without touching the pool map.
pub async fn check(Json(config): Json<NdsConfig>) -> Json<serde_json::Value> {
    let params = SessionParams::from(&config);
    match NdsClient::connect(&params).await {
        Ok(mut client) => {
            let alive = client.check_alive().await;
            client.close().await;
            if alive {
                Json(json!({ "code": 200, "message": "ok", "data": true }))
            } else {
                Json(json!({ "code": 500, "message": "connected but health check failed", "data": false }))
            }
        }
        Err(err) => {
            error!(nds_id = config.id, "credential check failed: {err}");
            Json(json!({ "code": 500, "message": err.to_string(), "data": false }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_request_defaults_offset_and_size() {
        let request: ReadRequest =
            serde_json::from_str(r#"{"NDSID": 7, "FilePath": "/mro/a.zip"}"#).unwrap();
        assert_eq!(request.header_offset, 0);
        assert_eq!(request.compress_size, None);
    }

    #[test]
    fn pool_action_parses_lowercase() {
        let request: UpdatePoolRequest = serde_json::from_value(json!({
            "action": "remove",
            "config": {"ID": 3}
        }))
        .unwrap();
        assert!(matches!(request.action, PoolAction::Remove));
        let ConfigId { id } = serde_json::from_value(request.config).unwrap();
        assert_eq!(id, 3);
    }

    #[test]
    fn zip_info_entry_omits_absent_fields() {
        let entry = ZipInfoEntry { status: "error".into(), info: None, error: Some("boom".into()) };
        let value = serde_json::to_value(&entry).unwrap();
        assert!(value.get("info").is_none());
        assert_eq!(value["error"], "boom");
    }
}

//! HTTP client for the gateway, used by the scanner and the worker.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::error::{NdsError, Result};
use crate::zip::MemberInfo;

use super::api::ZipInfoEntry;

const MODULE: &str = "gateway.client";

/// Scans and zip-info batches ride over NDS links; keep the same generous
/// timeout as the backend client.
const HTTP_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Deserialize)]
struct ZipInfoEnvelope {
    data: HashMap<String, ZipInfoEntry>,
}

#[derive(Clone)]
pub struct GatewayClient {
    base_url: String,
    http: Client,
}

impl GatewayClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| NdsError::io(MODULE, format!("http client: {e}")))?;
        Ok(Self { base_url: base_url.trim_end_matches('/').to_string(), http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    /// WebSocket URL for `ws/read`, derived from the HTTP base.
    pub fn ws_read_url(&self, client_id: &str) -> String {
        let base = self
            .base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{base}/nds/ws/read/{client_id}")
    }

    /// `POST /nds/scan`: recursive listing of one path.
    pub async fn scan(
        &self,
        nds_id: i64,
        scan_path: &str,
        filter_pattern: Option<&str>,
    ) -> Result<Vec<String>> {
        let body = json!({
            "nds_id": nds_id,
            "scan_path": scan_path,
            "filter_pattern": filter_pattern,
        });
        let resp = self
            .http
            .post(self.url("nds/scan"))
            .json(&body)
            .send()
            .await
            .map_err(|e| NdsError::io(MODULE, format!("scan: {e}")))?;
        if !resp.status().is_success() {
            return Err(NdsError::io(MODULE, format!("scan: status {}", resp.status())));
        }
        resp.json().await.map_err(|e| NdsError::io(MODULE, format!("scan body: {e}")))
    }

    /// `POST /nds/zip-info`: central directories for a batch of archives,
    /// keyed by path. Per-path failures come back inside the map.
    pub async fn zip_info(
        &self,
        nds_id: i64,
        file_paths: &[String],
    ) -> Result<HashMap<String, std::result::Result<Vec<MemberInfo>, String>>> {
        let body = json!({ "nds_id": nds_id, "file_paths": file_paths });
        let resp = self
            .http
            .post(self.url("nds/zip-info"))
            .json(&body)
            .send()
            .await
            .map_err(|e| NdsError::io(MODULE, format!("zip-info: {e}")))?;
        if !resp.status().is_success() {
            return Err(NdsError::io(MODULE, format!("zip-info: status {}", resp.status())));
        }
        let envelope: ZipInfoEnvelope =
            resp.json().await.map_err(|e| NdsError::io(MODULE, format!("zip-info body: {e}")))?;

        Ok(envelope
            .data
            .into_iter()
            .map(|(path, entry)| {
                let outcome = if entry.status == "success" {
                    Ok(entry.info.unwrap_or_default())
                } else {
                    Err(entry.error.unwrap_or_else(|| "unknown error".to_string()))
                };
                (path, outcome)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_swaps_scheme_and_appends_client_id() {
        let client = GatewayClient::new("http://gw:10002/").unwrap();
        assert_eq!(client.ws_read_url("abc"), "ws://gw:10002/nds/ws/read/abc");
    }

    #[test]
    fn zip_info_envelope_splits_success_and_error() {
        let raw = r#"{
            "code": 200,
            "data": {
                "/mro/ok.zip": {"status": "success", "info": []},
                "/mro/bad.zip": {"status": "error", "error": "ZIP CentDirectory warning"}
            }
        }"#;
        let envelope: ZipInfoEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.data["/mro/ok.zip"].status, "success");
        assert_eq!(envelope.data["/mro/bad.zip"].error.as_deref(), Some("ZIP CentDirectory warning"));
    }
}

//! Metadata-store HTTP client.
//!
//! The relational store holding NDS configs and the file-state table is an
//! external collaborator; scanner, worker and gateway reach it through this
//! client. Delivery is at-least-once end to end, so every write here is an
//! idempotent upsert keyed by `FileHash`.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{NdsError, Result};
use crate::nds::NdsConfig;

const MODULE: &str = "backend";

/// Generous client timeout: zip-info batches over slow NDS links and large
/// reads both ride on this client.
const HTTP_TIMEOUT: Duration = Duration::from_secs(3600);

/// Archive classification, decided by which configured path produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    #[serde(rename = "MRO")]
    Mro,
    #[serde(rename = "MDT")]
    Mdt,
}

/// Row states of the file-state table.
pub mod parsed {
    /// Discovered, waiting for dispatch.
    pub const PENDING: i8 = 0;
    /// Leased to a worker.
    pub const RESERVED: i8 = 1;
    /// Decoded and stored.
    pub const DONE: i8 = 2;
    /// Source vanished from the NDS.
    pub const SOURCE_MISSING: i8 = -1;
    /// Decoder or I/O failure; not retried.
    pub const PARSE_ERROR: i8 = -2;
}

/// One archive member tracked by the metadata store: the pipeline's unit
/// of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NdsFileRecord {
    #[serde(rename = "FileHash")]
    pub file_hash: String,
    #[serde(rename = "NDSID")]
    pub nds_id: i64,
    #[serde(rename = "FilePath")]
    pub file_path: String,
    #[serde(rename = "SubFileName")]
    pub sub_file_name: String,
    /// Absolute offset of the member's compressed payload in the archive.
    #[serde(rename = "HeaderOffset")]
    pub header_offset: u64,
    #[serde(rename = "CompressSize")]
    pub compress_size: u64,
    #[serde(rename = "FileSize")]
    pub file_size: u64,
    #[serde(rename = "FlagBits")]
    pub flag_bits: u16,
    #[serde(rename = "CompressType")]
    pub compress_type: u16,
    #[serde(rename = "DataType")]
    pub data_type: DataType,
    #[serde(rename = "eNodeBID")]
    pub enodeb_id: u64,
    /// Wallclock decoded from the archive name, `YYYY-MM-DD HH:MM:SS`.
    #[serde(rename = "FileTime")]
    pub file_time: String,
    #[serde(rename = "Parsed")]
    pub parsed: i8,
}

/// Deterministic content address of a member row.
///
/// `(NDSID, FilePath, SubFileName)` is the row's unique key; the hash is its
/// derivation and what workers report status against.
pub fn file_hash(nds_id: i64, file_path: &str, sub_file_name: &str) -> String {
    sha256::digest(format!("{nds_id}|{file_path}|{sub_file_name}"))
}

/// Active task time-range served by `/ndsfile/files`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(rename = "StartTime")]
    pub start_time: String,
    #[serde(rename = "EndTime")]
    pub end_time: String,
}

/// Store-side state for one NDS: known archive paths and the task
/// time-ranges that gate new discoveries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreFileState {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub times: Vec<TimeRange>,
}

/// Terminal-state report for one row.
#[derive(Debug, Clone, Serialize)]
pub struct ParsedUpdate {
    #[serde(rename = "FileHash")]
    pub file_hash: String,
    #[serde(rename = "Parsed")]
    pub parsed: i8,
}

#[derive(Deserialize)]
struct ListEnvelope {
    list: Vec<NdsConfig>,
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

/// HTTP client for the metadata store.
#[derive(Clone)]
pub struct BackendClient {
    base_url: String,
    http: Client,
}

impl BackendClient {
    /// # Errors
    ///
    /// `Io` when the underlying client cannot be built.
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

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| NdsError::io(MODULE, format!("GET {path}: {e}")))?;
        if !resp.status().is_success() {
            return Err(NdsError::io(MODULE, format!("GET {path}: status {}", resp.status())));
        }
        resp.json().await.map_err(|e| NdsError::io(MODULE, format!("GET {path}: body: {e}")))
    }

    async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<serde_json::Value> {
        let resp = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| NdsError::io(MODULE, format!("POST {path}: {e}")))?;
        if !resp.status().is_success() {
            return Err(NdsError::io(MODULE, format!("POST {path}: status {}", resp.status())));
        }
        resp.json().await.map_err(|e| NdsError::io(MODULE, format!("POST {path}: body: {e}")))
    }

    /// All NDS configs, enabled or not.
    pub async fn nds_list(&self) -> Result<Vec<NdsConfig>> {
        Ok(self.get_json::<ListEnvelope>("nds/list").await?.list)
    }

    /// One NDS config by id, `None` when the row is gone.
    pub async fn nds_config(&self, nds_id: i64) -> Result<Option<NdsConfig>> {
        Ok(self.nds_list().await?.into_iter().find(|config| config.id == nds_id))
    }

    /// Known archive paths and active task time-ranges for one NDS.
    pub async fn nds_files(&self, nds_id: i64) -> Result<StoreFileState> {
        let path = format!("ndsfile/files?nds_id={nds_id}");
        Ok(self.get_json::<DataEnvelope<StoreFileState>>(&path).await?.data)
    }

    /// Idempotent member-row upsert, one archive's rows per call.
    pub async fn submit_batch(&self, files: &[NdsFileRecord]) -> Result<()> {
        self.post_json("ndsfile/batch", &json!({ "files": files })).await?;
        Ok(())
    }

    /// Delete rows for archives that vanished from the NDS.
    pub async fn remove_files(&self, nds_id: i64, files: &[String]) -> Result<()> {
        self.post_json("ndsfile/remove", &json!({ "nds_id": nds_id, "files": files })).await?;
        Ok(())
    }

    /// Report terminal states for dispatched rows.
    pub async fn update_parsed(&self, updates: &[ParsedUpdate]) -> Result<()> {
        self.post_json("ndsfile/update-parsed", &json!({ "files": updates })).await?;
        Ok(())
    }

    /// Whether unparsed or reserved rows still exist for this NDS; this is
    /// the scanner's backlog gate.
    pub async fn has_pending_tasks(&self, nds_id: i64) -> Result<bool> {
        let path = format!("ndsfile/check-tasks/{nds_id}");
        Ok(self.get_json::<DataEnvelope<bool>>(&path).await?.data)
    }

    /// Lease one pending row from the dispatcher, oldest `FileTime` first.
    /// `None` when the queue is empty.
    pub async fn get_task(&self) -> Result<Option<NdsFileRecord>> {
        let value = self.post_json("ndsfile/get-task", &json!({})).await?;
        let data = value.get("data").cloned().unwrap_or(serde_json::Value::Null);
        if data.is_null() {
            return Ok(None);
        }
        serde_json::from_value(data)
            .map(Some)
            .map_err(|e| NdsError::io(MODULE, format!("get-task row: {e}")))
    }

    /// Announce this service instance to the store.
    pub async fn register_node(
        &self,
        node_type: &str,
        name: &str,
        host: &str,
        port: u16,
    ) -> Result<()> {
        self.post_json(
            "node/register",
            &json!({
                "NodeType": node_type,
                "NodeName": name,
                "Host": host,
                "Port": port,
                "Status": "Online",
            }),
        )
        .await?;
        Ok(())
    }

    /// Withdraw this service instance. Best-effort at shutdown.
    pub async fn unregister_node(&self, node_type: &str, name: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url("node/unregister"))
            .json(&json!({ "NodeType": node_type, "NodeName": name }))
            .send()
            .await
            .map_err(|e| NdsError::io(MODULE, format!("DELETE node/unregister: {e}")))?;
        if !resp.status().is_success() {
            return Err(NdsError::io(MODULE, format!("unregister: status {}", resp.status())));
        }
        Ok(())
    }
}

//! Protocol-agnostic NDS client.
//!
//! A Network Data Server is a vendor FTP or SFTP host holding measurement
//! archives. [`NdsClient`] hides the protocol behind one surface: connect
//! (with retries), health check, recursive listing, stat, offset-addressable
//! reads, and the streaming central-directory parse that lets the pipeline
//! record members without downloading archives.

pub mod ftp;
pub mod list;
pub mod sftp;

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{NdsError, Result};
use crate::zip::{MemberInfo, RangeRead, ZipParser};

use ftp::FtpTransport;
use list::join_remote;
use sftp::SftpTransport;

const MODULE: &str = "nds.client";

/// Connect attempts before giving up.
const CONNECT_RETRIES: u32 = 3;
/// Fixed delay between connect attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Bound on one connect attempt, handshake and login included.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Transfer protocol of an NDS endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "FTP")]
    Ftp,
    #[serde(rename = "SFTP")]
    Sftp,
}

/// NDS row as served by the metadata store (`GET /nds/list`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NdsConfig {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "Protocol")]
    pub protocol: Protocol,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Account")]
    pub account: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "MRO_Path", default)]
    pub mro_path: Option<String>,
    #[serde(rename = "MRO_Filter", default)]
    pub mro_filter: Option<String>,
    #[serde(rename = "MDT_Path", default)]
    pub mdt_path: Option<String>,
    #[serde(rename = "MDT_Filter", default)]
    pub mdt_filter: Option<String>,
    /// Enabled flag: only `1` is scanned and pooled.
    #[serde(rename = "Switch")]
    pub switch: i32,
    /// Connection-pool bound for this NDS.
    #[serde(rename = "PoolSize", default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    2
}

impl NdsConfig {
    pub fn enabled(&self) -> bool {
        self.switch == 1
    }
}

/// Credentials and endpoint of one NDS session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub account: String,
    pub password: String,
    /// Off by default: NDS endpoints live in operator-controlled networks.
    pub verify_host_key: bool,
}

impl From<&NdsConfig> for SessionParams {
    fn from(config: &NdsConfig) -> Self {
        Self {
            protocol: config.protocol,
            host: config.address.clone(),
            port: config.port,
            account: config.account.clone(),
            password: config.password.clone(),
            verify_host_key: false,
        }
    }
}

/// Size and modification time of one remote file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveStat {
    pub size: u64,
    pub modified: Option<NaiveDateTime>,
}

enum Transport {
    Ftp(FtpTransport),
    Sftp(SftpTransport),
}

/// One live session to an NDS.
pub struct NdsClient {
    transport: Transport,
}

impl NdsClient {
    /// Connect with up to three attempts, one second apart.
    ///
    /// # Errors
    ///
    /// `ConnectFailed` carrying the last attempt's failure.
    pub async fn connect(params: &SessionParams) -> Result<Self> {
        let mut last = None;
        for attempt in 1..=CONNECT_RETRIES {
            let outcome = tokio::time::timeout(CONNECT_TIMEOUT, Self::connect_once(params))
                .await
                .unwrap_or_else(|_| Err(NdsError::connect(MODULE, "connect attempt timed out")));
            match outcome {
                Ok(client) => return Ok(client),
                Err(err) => {
                    debug!(
                        module = MODULE,
                        host = %params.host,
                        attempt,
                        "connect attempt failed: {err}"
                    );
                    last = Some(err);
                    if attempt < CONNECT_RETRIES {
                        tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                    }
                }
            }
        }
        let last = last.unwrap_or_else(|| NdsError::connect(MODULE, "no attempt made"));
        Err(NdsError::connect(
            MODULE,
            format!("connect to {}:{} failed after {CONNECT_RETRIES} attempts: {last}", params.host, params.port),
        ))
    }

    async fn connect_once(params: &SessionParams) -> Result<Self> {
        let transport = match params.protocol {
            Protocol::Ftp => Transport::Ftp(
                FtpTransport::connect(&params.host, params.port, &params.account, &params.password)
                    .await?,
            ),
            Protocol::Sftp => Transport::Sftp(
                SftpTransport::connect(
                    &params.host,
                    params.port,
                    &params.account,
                    &params.password,
                    params.verify_host_key,
                )
                .await?,
            ),
        };
        Ok(Self { transport })
    }

    /// Cheap liveness probe; any failure means dead.
    pub async fn check_alive(&mut self) -> bool {
        match &mut self.transport {
            Transport::Ftp(t) => t.check_alive().await,
            Transport::Sftp(t) => t.check_alive().await,
        }
    }

    pub async fn close(&mut self) {
        match &mut self.transport {
            Transport::Ftp(t) => t.close().await,
            Transport::Sftp(t) => t.close().await,
        }
    }

    /// Recursively list files under `root`, optionally filtered by a regex
    /// applied to full paths.
    ///
    /// Traversal uses an explicit worklist (pop a directory, list it, push
    /// its subdirectories) on both protocols, so depth never becomes stack
    /// depth.
    ///
    /// # Errors
    ///
    /// `ParseError` for an invalid filter (a user error, never silently
    /// ignored), transport errors otherwise.
    pub async fn list_recursive(&mut self, root: &str, filter: Option<&str>) -> Result<Vec<String>> {
        let pattern = compile_filter(filter)?;

        let mut files = Vec::new();
        let mut worklist = vec![root.trim_end_matches('/').to_string()];
        if worklist[0].is_empty() {
            worklist[0] = "/".to_string();
        }

        while let Some(dir) = worklist.pop() {
            let entries = match &mut self.transport {
                Transport::Ftp(t) => t.list_dir(&dir).await?,
                Transport::Sftp(t) => t.list_dir(&dir).await?,
            };
            for entry in entries {
                let full = join_remote(&dir, &entry.name);
                if entry.is_directory {
                    worklist.push(full);
                } else if pattern.as_ref().is_none_or(|p| p.is_match(&full)) {
                    files.push(full);
                }
            }
        }
        Ok(files)
    }

    /// Size and mtime of one remote file.
    ///
    /// # Errors
    ///
    /// `SourceMissing` when the path is gone.
    pub async fn stat(&mut self, path: &str) -> Result<ArchiveStat> {
        let (size, modified) = match &mut self.transport {
            Transport::Ftp(t) => t.stat(path).await?,
            Transport::Sftp(t) => t.stat(path).await?,
        };
        Ok(ArchiveStat { size, modified })
    }

    /// Read `[offset, offset + length)` of a remote file; an unspecified or
    /// overrunning length is clamped to end of file.
    pub async fn read_range(
        &mut self,
        path: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Vec<u8>> {
        let stat = self.stat(path).await?;
        let available = stat.size.saturating_sub(offset);
        let length = length.map_or(available, |len| len.min(available));
        if length == 0 {
            return Ok(Vec::new());
        }
        self.read_at(path, offset, length).await
    }

    async fn read_at(&mut self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        match &mut self.transport {
            Transport::Ftp(t) => t.read_at(path, offset, length).await,
            Transport::Sftp(t) => t.read_at(path, offset, length).await,
        }
    }

    /// Parse an archive's central directory without downloading its payload.
    ///
    /// Published member offsets address the compressed payload directly; see
    /// [`crate::zip::parser`] for the contract.
    pub async fn parse_zip_central_directory(&mut self, path: &str) -> Result<Vec<MemberInfo>> {
        let stat = self.stat(path).await?;
        let reader = ArchiveReader { client: self, path, size: stat.size };
        ZipParser::new(reader).members().await
    }
}

/// Compile an optional path filter.
///
/// A missing filter accepts everything; an empty or malformed one is a
/// user error, never silently ignored.
fn compile_filter(filter: Option<&str>) -> Result<Option<Regex>> {
    match filter {
        None => Ok(None),
        Some("") => Err(NdsError::parse(MODULE, "empty filter pattern")),
        Some(expr) => Regex::new(expr)
            .map(Some)
            .map_err(|e| NdsError::parse(MODULE, format!("invalid filter {expr:?}: {e}"))),
    }
}

/// [`RangeRead`] over one archive on an open NDS session.
struct ArchiveReader<'a> {
    client: &'a mut NdsClient,
    path: &'a str,
    size: u64,
}

#[async_trait]
impl RangeRead for ArchiveReader<'_> {
    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let want = (buf.len() as u64).min(self.size.saturating_sub(offset));
        if want == 0 {
            return Ok(0);
        }
        let data = self.client.read_at(self.path, offset, want).await?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nds_config_uses_store_field_names() {
        let config: NdsConfig = serde_json::from_value(serde_json::json!({
            "ID": 7,
            "Protocol": "SFTP",
            "Address": "10.0.0.7",
            "Port": 2222,
            "Account": "u",
            "Password": "p",
            "MRO_Path": "/mro",
            "MRO_Filter": r".*_MRO_.*\.zip$",
            "MDT_Path": "/mdt",
            "MDT_Filter": null,
            "Switch": 1
        }))
        .unwrap();
        assert_eq!(config.id, 7);
        assert_eq!(config.protocol, Protocol::Sftp);
        assert_eq!(config.pool_size, 2);
        assert!(config.enabled());
        assert_eq!(config.mdt_filter, None);
    }

    #[test]
    fn filter_compilation_surfaces_user_errors() {
        use crate::error::ErrorKind;

        assert!(compile_filter(None).unwrap().is_none());
        let pattern = compile_filter(Some(r".*_MRO_.*\.zip$")).unwrap().unwrap();
        assert!(pattern.is_match("/mro/FDD-LTE_MRO_ZTE_OMC1_292551_20241220023000.zip"));

        assert_eq!(compile_filter(Some("")).unwrap_err().kind, ErrorKind::ParseError);
        assert_eq!(compile_filter(Some("[unclosed")).unwrap_err().kind, ErrorKind::ParseError);
    }

    #[test]
    fn session_params_default_to_trusting_host_keys() {
        let config: NdsConfig = serde_json::from_value(serde_json::json!({
            "ID": 1, "Protocol": "FTP", "Address": "a", "Port": 21,
            "Account": "u", "Password": "p", "Switch": 0
        }))
        .unwrap();
        let params = SessionParams::from(&config);
        assert!(!params.verify_host_key);
        assert!(!config.enabled());
    }
}

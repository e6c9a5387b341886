//! SFTP transport.
//!
//! One russh client session carrying one sftp subsystem channel. Host-key
//! verification is disabled by default: NDS endpoints live inside
//! operator-controlled networks and their keys churn with vendor
//! maintenance. Set `verify_host_key` when that assumption does not hold;
//! the handler then refuses unknown keys outright (there is no known-hosts
//! store to consult in this deployment).

use russh::client::{AuthResult, Config, Handle, Handler, connect};
use russh::keys::ssh_key::PublicKey;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{OpenFlags, StatusCode};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use std::io::SeekFrom;
use std::sync::Arc;

use crate::error::{NdsError, Result};

use super::list::ListEntry;

const MODULE: &str = "nds.sftp";

/// russh client handler carrying the host-key trust decision.
struct HostKeyPolicy {
    verify: bool,
}

impl Handler for HostKeyPolicy {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        Ok(!self.verify)
    }
}

pub struct SftpTransport {
    handle: Handle<HostKeyPolicy>,
    session: SftpSession,
}

impl SftpTransport {
    /// Open an SSH session, authenticate with a password and start the sftp
    /// subsystem. Single attempt; connect retries live in the client facade.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        verify_host_key: bool,
    ) -> Result<Self> {
        let config = Arc::new(Config::default());
        let policy = HostKeyPolicy { verify: verify_host_key };

        let mut handle = connect(config, (host, port), policy)
            .await
            .map_err(|e| NdsError::connect(MODULE, format!("connect {host}:{port}: {e}")))?;

        let auth = handle
            .authenticate_password(user, password)
            .await
            .map_err(|e| NdsError::connect(MODULE, format!("auth: {e}")))?;
        if !matches!(auth, AuthResult::Success) {
            return Err(NdsError::connect(MODULE, "password authentication rejected"));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| NdsError::connect(MODULE, format!("channel: {e}")))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| NdsError::connect(MODULE, format!("sftp subsystem: {e}")))?;
        let session = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| NdsError::connect(MODULE, format!("sftp session: {e}")))?;

        debug!(module = MODULE, "sftp session established");
        Ok(Self { handle, session })
    }

    /// Alive as long as the root directory can be listed.
    pub async fn check_alive(&mut self) -> bool {
        self.session.read_dir("/").await.is_ok()
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.session.close().await {
            warn!(module = MODULE, "sftp close failed: {e}");
        }
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
    }

    /// List one directory.
    pub async fn list_dir(&mut self, path: &str) -> Result<Vec<ListEntry>> {
        let entries = self
            .session
            .read_dir(path)
            .await
            .map_err(|e| map_sftp_err(e, path))?;
        Ok(entries
            .into_iter()
            .filter(|entry| {
                let name = entry.file_name();
                name != "." && name != ".."
            })
            .map(|entry| ListEntry {
                is_directory: entry.file_type().is_dir(),
                size: entry.metadata().size,
                name: entry.file_name(),
            })
            .collect())
    }

    pub async fn stat(&mut self, path: &str) -> Result<(u64, Option<chrono::NaiveDateTime>)> {
        let attrs = self
            .session
            .metadata(path)
            .await
            .map_err(|e| map_sftp_err(e, path))?;
        let size = attrs.size.unwrap_or(0);
        let modified = attrs
            .mtime
            .and_then(|secs| chrono::DateTime::from_timestamp(secs as i64, 0))
            .map(|dt| dt.naive_utc());
        Ok((size, modified))
    }

    /// Open the file, seek to `offset` and read up to `length` bytes.
    pub async fn read_at(&mut self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut file = self
            .session
            .open_with_flags(path, OpenFlags::READ)
            .await
            .map_err(|e| map_sftp_err(e, path))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| NdsError::io(MODULE, format!("{path}: seek: {e}")))?;
        }

        let mut buf = Vec::with_capacity(length as usize);
        let mut chunk = vec![0u8; 256 * 1024];
        while (buf.len() as u64) < length {
            let want = (length - buf.len() as u64).min(chunk.len() as u64) as usize;
            let n = file
                .read(&mut chunk[..want])
                .await
                .map_err(|e| NdsError::io(MODULE, format!("{path}: read: {e}")))?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        Ok(buf)
    }
}

/// Map russh-sftp failures onto pipeline error kinds.
fn map_sftp_err(err: russh_sftp::client::error::Error, path: &str) -> NdsError {
    if let russh_sftp::client::error::Error::Status(status) = &err {
        if status.status_code == StatusCode::NoSuchFile {
            return NdsError::missing(MODULE, path);
        }
    }
    NdsError::io(MODULE, format!("{path}: {err}"))
}

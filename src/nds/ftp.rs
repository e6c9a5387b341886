//! FTP transport.
//!
//! suppaftp's client is blocking, so every operation moves the control
//! stream into `spawn_blocking` and back. Extended Passive Mode is used
//! throughout (plays well with NAT and container networks) and transfers
//! run in binary type.
//!
//! Ranged reads are REST + RETR: seek the transfer offset, stream until
//! enough bytes arrived, then abort the data connection. Aborting mid-RETR
//! is best-effort; if the control channel is left in a bad state the pool's
//! next health check retires the connection.

use std::io::Read;

use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode, Status};
use tracing::{debug, warn};

use crate::error::{NdsError, Result};

use super::list::ListEntry;

const MODULE: &str = "nds.ftp";

pub struct FtpTransport {
    /// Control connection; `None` only while an operation holds it.
    stream: Option<FtpStream>,
}

impl FtpTransport {
    /// Open one control connection and log in. Single attempt; connect
    /// retries live in the client facade.
    pub async fn connect(host: &str, port: u16, user: &str, password: &str) -> Result<Self> {
        let addr = format!("{host}:{port}");
        let user = user.to_string();
        let password = password.to_string();

        let stream = tokio::task::spawn_blocking(move || -> Result<FtpStream> {
            let mut stream = FtpStream::connect(&addr)
                .map_err(|e| NdsError::connect(MODULE, format!("connect {addr}: {e}")))?;
            stream.set_mode(Mode::ExtendedPassive);
            stream
                .login(&user, &password)
                .map_err(|e| NdsError::connect(MODULE, format!("login: {e}")))?;
            stream
                .transfer_type(FileType::Binary)
                .map_err(|e| NdsError::connect(MODULE, format!("binary mode: {e}")))?;
            Ok(stream)
        })
        .await
        .map_err(|e| NdsError::io(MODULE, format!("ftp task: {e}")))??;

        debug!(module = MODULE, "ftp session established");
        Ok(Self { stream: Some(stream) })
    }

    /// Run a blocking operation against the control stream.
    async fn run<T, F>(&mut self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<T> + Send + 'static,
    {
        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| NdsError::io(MODULE, "ftp session already closed"))?;
        let (stream, out) = tokio::task::spawn_blocking(move || {
            let out = op(&mut stream);
            (stream, out)
        })
        .await
        .map_err(|e| NdsError::io(MODULE, format!("ftp task: {e}")))?;
        self.stream = Some(stream);
        out
    }

    /// CWD `/`: alive as long as the server answers with any 2xx.
    pub async fn check_alive(&mut self) -> bool {
        self.run(|stream| match stream.cwd("/") {
            Ok(()) => Ok(true),
            // Some servers answer CWD with 200 or 257 instead of 250.
            Err(FtpError::UnexpectedResponse(resp)) => {
                Ok(matches!(resp.status, Status::CommandOk | Status::PathCreated))
            }
            Err(_) => Ok(false),
        })
        .await
        .unwrap_or(false)
    }

    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let quit = tokio::task::spawn_blocking(move || stream.quit()).await;
            if let Ok(Err(e)) = quit {
                warn!(module = MODULE, "ftp quit failed: {e}");
            }
        }
    }

    /// List one directory.
    pub async fn list_dir(&mut self, path: &str) -> Result<Vec<ListEntry>> {
        let path = path.to_string();
        self.run(move |stream| {
            let lines = stream.list(Some(&path)).map_err(|e| map_ftp_err(e, &path))?;
            Ok(lines.iter().filter_map(|line| ListEntry::parse(line)).collect())
        })
        .await
    }

    /// SIZE + MDTM for one file.
    pub async fn stat(&mut self, path: &str) -> Result<(u64, Option<chrono::NaiveDateTime>)> {
        let path = path.to_string();
        self.run(move |stream| {
            let size = stream.size(&path).map_err(|e| map_ftp_err(e, &path))? as u64;
            let modified = stream.mdtm(&path).ok();
            Ok((size, modified))
        })
        .await
    }

    /// Read up to `length` bytes starting at `offset` via REST + RETR,
    /// aborting the data connection once enough bytes arrived.
    pub async fn read_at(&mut self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let path = path.to_string();
        self.run(move |stream| {
            stream.resume_transfer(offset as usize).map_err(|e| map_ftp_err(e, &path))?;
            let mut data = match stream.retr_as_stream(&path) {
                Ok(data) => data,
                Err(e) => {
                    // REST survives until the next transfer; reset so a
                    // failed RETR does not shift a later one.
                    let _ = stream.resume_transfer(0);
                    return Err(map_ftp_err(e, &path));
                }
            };

            let mut buf = Vec::with_capacity(length as usize);
            let complete = (&mut data)
                .take(length)
                .read_to_end(&mut buf)
                .map(|n| n as u64 == length)
                .unwrap_or(false);

            if complete {
                // More data may remain on the wire; tear the transfer down.
                if let Err(e) = stream.abort(data) {
                    warn!(module = MODULE, "abort after ranged RETR failed: {e}");
                }
            } else if let Err(e) = stream.finalize_retr_stream(data) {
                warn!(module = MODULE, "finalize after ranged RETR failed: {e}");
            }
            Ok(buf)
        })
        .await
    }
}

/// Map suppaftp failures onto pipeline error kinds; 550 means the path is gone.
fn map_ftp_err(err: FtpError, path: &str) -> NdsError {
    let missing = matches!(&err, FtpError::UnexpectedResponse(resp) if is_missing_status(resp.status));
    if missing {
        NdsError::missing(MODULE, path)
    } else {
        NdsError::io(MODULE, format!("{path}: {err}"))
    }
}

/// 550: requested action not taken, file unavailable.
fn is_missing_status(status: Status) -> bool {
    status == Status::FileUnavailable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_means_missing() {
        assert!(is_missing_status(Status::FileUnavailable));
        assert!(!is_missing_status(Status::BadCommand));
        assert!(!is_missing_status(Status::RequestedFileActionOk));
    }
}

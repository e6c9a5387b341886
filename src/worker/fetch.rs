//! Member-byte fetch over the gateway's streaming read endpoint.
//!
//! The worker opens a WebSocket per task, sends one request frame naming
//! `[HeaderOffset, HeaderOffset + CompressSize)`, and reassembles binary
//! frames until the `{"end_of_file": true}` trailer. Error frames carry the
//! HTTP-ish code the row state machine switches on: 404 means the source
//! vanished (`Parsed = -1`), anything else is a transient or hard failure
//! (`Parsed = -2` once the decoder path owns it).

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::backend::NdsFileRecord;
use crate::error::{ErrorKind, NdsError, Result};
use crate::gateway::ReadRequest;
use crate::gateway::client::GatewayClient;

const MODULE: &str = "worker.fetch";

/// Control frames the gateway may send instead of, or after, data.
#[derive(Debug, Deserialize)]
struct ControlFrame {
    #[serde(default)]
    end_of_file: bool,
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

enum Control {
    End,
    Failure { code: u16, message: String },
}

fn parse_control(text: &str) -> Result<Control> {
    let frame: ControlFrame = serde_json::from_str(text)
        .map_err(|e| NdsError::io(MODULE, format!("bad control frame: {e}")))?;
    if frame.end_of_file {
        return Ok(Control::End);
    }
    match frame.code {
        Some(code) => Ok(Control::Failure {
            code,
            message: frame.message.unwrap_or_else(|| "unknown error".to_string()),
        }),
        None => Err(NdsError::io(MODULE, format!("unrecognized control frame: {text}"))),
    }
}

/// Stream exactly the task's compressed byte range from the gateway.
///
/// # Errors
///
/// `SourceMissing` when the gateway reports 404, `NotConfigured` on 403,
/// `Io` for short transfers, dropped sockets and everything else.
pub async fn fetch_member(gateway: &GatewayClient, task: &NdsFileRecord) -> Result<Vec<u8>> {
    let client_id = Uuid::new_v4().to_string();
    let url = gateway.ws_read_url(&client_id);

    let (mut socket, _) = connect_async(url.as_str())
        .await
        .map_err(|e| NdsError::io(MODULE, format!("ws connect {url}: {e}")))?;

    let request = ReadRequest {
        nds_id: task.nds_id,
        file_path: task.file_path.clone(),
        header_offset: task.header_offset,
        compress_size: Some(task.compress_size),
    };
    let body = serde_json::to_string(&request)
        .map_err(|e| NdsError::io(MODULE, format!("request frame: {e}")))?;
    socket
        .send(Message::Text(body.into()))
        .await
        .map_err(|e| NdsError::io(MODULE, format!("ws send: {e}")))?;

    let mut payload: Vec<u8> = Vec::with_capacity(task.compress_size as usize);
    while let Some(frame) = socket.next().await {
        let frame = frame.map_err(|e| NdsError::io(MODULE, format!("ws recv: {e}")))?;
        match frame {
            Message::Binary(chunk) => payload.extend_from_slice(&chunk),
            Message::Text(text) => match parse_control(text.as_str())? {
                Control::End => {
                    let _ = socket.close(None).await;
                    if payload.len() as u64 != task.compress_size {
                        return Err(NdsError::io(
                            MODULE,
                            format!(
                                "short transfer for {}: got {} of {} bytes",
                                task.file_path,
                                payload.len(),
                                task.compress_size
                            ),
                        ));
                    }
                    return Ok(payload);
                }
                Control::Failure { code, message } => {
                    let _ = socket.close(None).await;
                    return Err(failure_to_error(code, &task.file_path, message));
                }
            },
            Message::Close(_) => break,
            _ => continue,
        }
    }

    Err(NdsError::io(MODULE, format!("ws closed before trailer for {}", task.file_path)))
}

fn failure_to_error(code: u16, path: &str, message: String) -> NdsError {
    match code {
        404 => NdsError::missing(MODULE, path),
        403 => NdsError::new(ErrorKind::NotConfigured, MODULE, message),
        _ => NdsError::io(MODULE, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailer_parses_as_end() {
        assert!(matches!(parse_control(r#"{"end_of_file": true}"#).unwrap(), Control::End));
    }

    #[test]
    fn error_frame_carries_code_and_message() {
        let control = parse_control(r#"{"code": 404, "message": "gone"}"#).unwrap();
        match control {
            Control::Failure { code, message } => {
                assert_eq!(code, 404);
                assert_eq!(message, "gone");
            }
            Control::End => panic!("expected failure"),
        }
    }

    #[test]
    fn unknown_frames_are_rejected() {
        assert!(parse_control(r#"{"hello": 1}"#).is_err());
        assert!(parse_control("not json").is_err());
    }

    #[test]
    fn codes_map_to_row_semantics() {
        assert_eq!(failure_to_error(404, "/a", "gone".into()).kind, ErrorKind::SourceMissing);
        assert_eq!(failure_to_error(403, "/a", "no".into()).kind, ErrorKind::NotConfigured);
        assert_eq!(failure_to_error(500, "/a", "err".into()).kind, ErrorKind::Io);
    }
}

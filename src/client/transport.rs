//! Framed JSON transport between host and analyzer processes.
//!
//! Messages are `Content-Length: N\r\n\r\n<json>` frames in both
//! directions. Before the first frame the analyzer announces the protocol
//! version as a single line; the magic cookie travels in its environment.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::context::ScanContext;
use crate::envelope::ScanResponse;
use crate::error::AnalyzerError;

/// Environment variable carrying the magic cookie to analyzer processes.
pub const HANDSHAKE_COOKIE_KEY: &str = "TREPORT_PLUGIN";
/// Expected magic cookie value.
pub const HANDSHAKE_COOKIE_VALUE: &str = "treport";
/// Version of the host↔analyzer protocol.
pub const PROTOCOL_VERSION: u32 = 1;

pub(crate) const SCAN_METHOD: &str = "scan";

/// One request frame.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    pub params: ScanContext,
}

/// Borrowed request frame; what the host actually serializes.
#[derive(Debug, Serialize)]
pub(crate) struct RequestRef<'a> {
    pub id: u64,
    pub method: &'a str,
    pub params: &'a ScanContext,
}

/// One response frame; exactly one of `result`/`error` is set.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ScanResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Writes one framed JSON message.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), AnalyzerError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message).map_err(AnalyzerError::Encode)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed JSON message. `Ok(None)` means the peer closed the
/// stream between frames; EOF inside a frame is a protocol violation.
pub async fn read_frame<R, T>(reader: &mut BufReader<R>) -> Result<Option<T>, AnalyzerError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return if length.is_none() {
                Ok(None)
            } else {
                Err(AnalyzerError::Protocol(
                    "connection closed mid-frame".to_string(),
                ))
            };
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix("Content-Length:") {
            length = value.trim().parse().ok();
        }
    }

    let Some(length) = length else {
        return Err(AnalyzerError::Protocol(
            "missing Content-Length header".to_string(),
        ));
    };
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    let message = serde_json::from_slice(&body).map_err(AnalyzerError::Decode)?;
    Ok(Some(message))
}

/// Reads and validates the one-line handshake an analyzer writes at
/// startup.
pub async fn read_handshake<R>(reader: &mut BufReader<R>, name: &str) -> Result<(), AnalyzerError>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    let read = reader.read_line(&mut line).await?;
    if read == 0 {
        return Err(AnalyzerError::Handshake {
            name: name.to_string(),
            reason: "analyzer exited before the handshake".to_string(),
        });
    }
    let version: u32 = line.trim().parse().map_err(|_| AnalyzerError::Handshake {
        name: name.to_string(),
        reason: format!("unexpected handshake line {:?}", line.trim()),
    })?;
    if version != PROTOCOL_VERSION {
        return Err(AnalyzerError::Handshake {
            name: name.to_string(),
            reason: format!("protocol version {version} is not supported"),
        });
    }
    Ok(())
}

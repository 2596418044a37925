//! Host-side analyzer clients.
//!
//! A client owns one analyzer subprocess for the lifetime of a scan run and
//! multiplexes `scan` RPCs over its stdio, one in flight at a time.

pub mod transport;

use std::path::Path;
use std::process::Stdio;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::context::ScanContext;
use crate::envelope::ScanResponse;
use crate::error::AnalyzerError;
use transport::{RequestRef, Response, HANDSHAKE_COOKIE_KEY, HANDSHAKE_COOKIE_VALUE, SCAN_METHOD};

/// Issues scan RPCs on behalf of the orchestrator. Tests substitute
/// in-memory services for the subprocess client.
#[async_trait]
pub trait ScanService: Send + Sync {
    /// Scans one revision. On success the envelope is also accumulated into
    /// the context's data map under its payload name.
    async fn scan(&self, scanctx: &mut ScanContext) -> Result<ScanResponse, AnalyzerError>;
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

struct ClientInner {
    child: Option<Child>,
    writer: BoxedWriter,
    reader: BufReader<BoxedReader>,
    next_id: u64,
}

/// A long-lived handle to one analyzer subprocess.
pub struct AnalyzerClient {
    name: String,
    mtime: SystemTime,
    inner: Mutex<ClientInner>,
}

impl AnalyzerClient {
    /// Shell-executes the analyzer command, records the binary's mtime for
    /// the version registry and performs the protocol handshake.
    pub async fn spawn(
        name: &str,
        command: &Path,
        args: &[String],
    ) -> Result<Self, AnalyzerError> {
        let metadata =
            tokio::fs::metadata(command)
                .await
                .map_err(|source| AnalyzerError::Setup {
                    name: name.to_string(),
                    source,
                })?;
        let mtime = metadata.modified().map_err(|source| AnalyzerError::Setup {
            name: name.to_string(),
            source,
        })?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command.to_string_lossy().as_ref())
            .args(args)
            .env(HANDSHAKE_COOKIE_KEY, HANDSHAKE_COOKIE_VALUE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AnalyzerError::Setup {
                name: name.to_string(),
                source,
            })?;

        let writer: BoxedWriter = Box::new(child.stdin.take().ok_or_else(|| {
            AnalyzerError::Protocol("analyzer stdin unavailable".to_string())
        })?);
        let stdout: BoxedReader = Box::new(child.stdout.take().ok_or_else(|| {
            AnalyzerError::Protocol("analyzer stdout unavailable".to_string())
        })?);
        let mut reader = BufReader::new(stdout);

        transport::read_handshake(&mut reader, name).await?;
        debug!(analyzer = name, command = %command.display(), "analyzer handshake complete");

        Ok(Self {
            name: name.to_string(),
            mtime,
            inner: Mutex::new(ClientInner {
                child: Some(child),
                writer,
                reader,
                next_id: 0,
            }),
        })
    }

    /// Builds a client over pre-connected streams. Used by tests in place of
    /// a real subprocess; the handshake is still expected on `reader`.
    #[cfg(test)]
    pub(crate) async fn from_streams<R, W>(
        name: &str,
        mtime: SystemTime,
        reader: R,
        writer: W,
    ) -> Result<Self, AnalyzerError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut reader = BufReader::new(Box::new(reader) as BoxedReader);
        transport::read_handshake(&mut reader, name).await?;
        Ok(Self {
            name: name.to_string(),
            mtime,
            inner: Mutex::new(ClientInner {
                child: None,
                writer: Box::new(writer),
                reader,
                next_id: 0,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filesystem mtime of the analyzer binary, captured at setup time.
    pub fn mtime(&self) -> SystemTime {
        self.mtime
    }

    /// Kills the analyzer subprocess. Safe to call more than once.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(mut child) = inner.child.take() {
            if let Err(err) = child.kill().await {
                warn!(analyzer = %self.name, error = %err, "failed to kill analyzer");
            }
        }
    }
}

#[async_trait]
impl ScanService for AnalyzerClient {
    async fn scan(&self, scanctx: &mut ScanContext) -> Result<ScanResponse, AnalyzerError> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = inner.next_id;

        let request = RequestRef {
            id,
            method: SCAN_METHOD,
            params: scanctx,
        };
        transport::write_frame(&mut inner.writer, &request).await?;

        let response: Response = transport::read_frame(&mut inner.reader)
            .await?
            .ok_or_else(|| AnalyzerError::Rpc {
                name: self.name.clone(),
                message: "analyzer closed the connection".to_string(),
            })?;
        if response.id != id {
            return Err(AnalyzerError::Protocol(format!(
                "response id {} does not match request id {id}",
                response.id
            )));
        }
        if let Some(message) = response.error {
            return Err(AnalyzerError::Rpc {
                name: self.name.clone(),
                message,
            });
        }
        let result = response.result.ok_or_else(|| AnalyzerError::Rpc {
            name: self.name.clone(),
            message: "response carried neither result nor error".to_string(),
        })?;

        scanctx.store_result(&self.name, result.clone());
        Ok(result)
    }
}

//! Serving harness for analyzer processes.
//!
//! An analyzer binary validates the magic cookie in its environment, writes
//! the protocol version as its first stdout line and then answers framed
//! scan requests until the host closes the pipe. Anything the analyzer
//! wants to log must go to stderr; stdout belongs to the protocol.

use std::env;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{stdin, stdout, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::client::transport::{
    self, Request, Response, HANDSHAKE_COOKIE_KEY, HANDSHAKE_COOKIE_VALUE, PROTOCOL_VERSION,
    SCAN_METHOD,
};
use crate::context::ScanContext;
use crate::envelope::ScanResponse;

/// Implemented by analyzer authors; one call per scanned revision.
#[async_trait]
pub trait AnalyzerScanner: Send + Sync {
    async fn scan(&self, scanctx: &ScanContext) -> Result<ScanResponse>;
}

/// Serves `scanner` over stdio. Analyzer binaries call this from `main`.
pub async fn serve<S: AnalyzerScanner>(scanner: S) -> Result<()> {
    let cookie = env::var(HANDSHAKE_COOKIE_KEY).unwrap_or_default();
    if cookie != HANDSHAKE_COOKIE_VALUE {
        anyhow::bail!(
            "this binary is a treport analyzer and must be launched by the treport host"
        );
    }
    serve_on(scanner, stdin(), stdout()).await
}

/// Stream-generic serve loop; `serve` wires it to stdio.
pub async fn serve_on<S, R, W>(scanner: S, reader: R, mut writer: W) -> Result<()>
where
    S: AnalyzerScanner,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(format!("{PROTOCOL_VERSION}\n").as_bytes())
        .await?;
    writer.flush().await?;

    let mut reader = BufReader::new(reader);
    while let Some(request) = transport::read_frame::<_, Request>(&mut reader).await? {
        let response = match handle(&scanner, &request).await {
            Ok(result) => Response {
                id: request.id,
                result: Some(result),
                error: None,
            },
            Err(err) => Response {
                id: request.id,
                result: None,
                error: Some(format!("{err:#}")),
            },
        };
        transport::write_frame(&mut writer, &response).await?;
    }
    Ok(())
}

async fn handle<S: AnalyzerScanner>(scanner: &S, request: &Request) -> Result<ScanResponse> {
    if request.method != SCAN_METHOD {
        anyhow::bail!("unsupported method {:?}", request.method);
    }
    scanner.scan(&request.params).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{AnalyzerClient, ScanService};
    use crate::envelope::{to_response, TypedPayload};
    use crate::error::AnalyzerError;
    use serde::{Deserialize, Serialize};
    use std::time::SystemTime;
    use tokio::io::duplex;

    #[derive(Debug, Serialize, Deserialize)]
    struct Echo {
        revision: String,
    }

    impl TypedPayload for Echo {
        const TYPE_NAME: &'static str = "treport.test.Echo";
    }

    struct EchoScanner;

    #[async_trait]
    impl AnalyzerScanner for EchoScanner {
        async fn scan(&self, scanctx: &ScanContext) -> Result<ScanResponse> {
            Ok(to_response(&Echo {
                revision: scanctx.commit.hash.clone(),
            })?)
        }
    }

    struct FailingScanner;

    #[async_trait]
    impl AnalyzerScanner for FailingScanner {
        async fn scan(&self, _scanctx: &ScanContext) -> Result<ScanResponse> {
            anyhow::bail!("boom")
        }
    }

    #[tokio::test]
    async fn test_serve_answers_scan_requests() {
        let (host_side, analyzer_side) = duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_side);
        let (analyzer_read, analyzer_write) = tokio::io::split(analyzer_side);

        let server = tokio::spawn(serve_on(EchoScanner, analyzer_read, analyzer_write));

        let client = AnalyzerClient::from_streams("echo", SystemTime::now(), host_read, host_write)
            .await
            .unwrap();

        let mut scanctx = ScanContext::default();
        scanctx.commit.hash = "deadbeef".to_string();
        let response = client.scan(&mut scanctx).await.unwrap();
        assert_eq!(response.name, "treport.test.Echo");

        let echo: Echo = scanctx.get_data().unwrap();
        assert_eq!(echo.revision, "deadbeef");
        assert_eq!(scanctx.produced_type("echo"), Some("treport.test.Echo"));

        drop(client);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_scanner_errors_become_rpc_errors() {
        let (host_side, analyzer_side) = duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_side);
        let (analyzer_read, analyzer_write) = tokio::io::split(analyzer_side);

        let server = tokio::spawn(serve_on(FailingScanner, analyzer_read, analyzer_write));

        let client = AnalyzerClient::from_streams("bad", SystemTime::now(), host_read, host_write)
            .await
            .unwrap();

        let mut scanctx = ScanContext::default();
        let err = client.scan(&mut scanctx).await.unwrap_err();
        match err {
            AnalyzerError::Rpc { name, message } => {
                assert_eq!(name, "bad");
                assert!(message.contains("boom"));
            }
            other => panic!("expected Rpc error, got {other:?}"),
        }
        assert!(scanctx.data.is_empty());

        drop(client);
        server.await.unwrap().unwrap();
    }
}

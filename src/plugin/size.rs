//! Built-in analyzer tracking total blob size across revisions.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::ScanContext;
use crate::envelope::{to_response, ScanResponse, TypedPayload};
use crate::error::EnvelopeError;
use crate::model::ActionType;
use crate::plugin::serve::AnalyzerScanner;

/// Accumulated repository size produced by the `size` analyzer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeData {
    pub size: i64,
}

impl TypedPayload for SizeData {
    const TYPE_NAME: &'static str = "treport.plugin.size.SizeData";
}

/// Applies each revision's changes to the running total carried over from
/// the previous revision.
#[derive(Debug, Default)]
pub struct SizeScanner;

#[async_trait]
impl AnalyzerScanner for SizeScanner {
    async fn scan(&self, scanctx: &ScanContext) -> Result<ScanResponse> {
        let mut size = match scanctx.get_data::<SizeData>() {
            Ok(data) => data.size,
            Err(EnvelopeError::NoData) => 0,
            Err(err) => return Err(err.into()),
        };

        for change in &scanctx.changes {
            let from = change.from.as_ref().map_or(0, |file| file.size);
            let to = change.to.as_ref().map_or(0, |file| file.size);
            match change.action {
                ActionType::Added => size += to,
                ActionType::Deleted => size -= from,
                ActionType::Updated => size += to - from,
            }
        }

        debug!(revision = %scanctx.commit.hash, size, "accumulated repository size");
        Ok(to_response(&SizeData { size })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Change, File};

    fn file(size: i64) -> Option<File> {
        Some(File {
            name: "f".into(),
            mode: 0o100644,
            size,
            hash: String::new(),
        })
    }

    #[tokio::test]
    async fn test_size_starts_from_zero() {
        let mut scanctx = ScanContext::default();
        scanctx.changes = vec![
            Change {
                action: ActionType::Added,
                from: None,
                to: file(10),
            },
            Change {
                action: ActionType::Added,
                from: None,
                to: file(5),
            },
        ];

        let response = SizeScanner.scan(&scanctx).await.unwrap();
        let data: SizeData = response.unpack().unwrap();
        assert_eq!(data.size, 15);
    }

    #[tokio::test]
    async fn test_size_accumulates_across_revisions() {
        let mut scanctx = ScanContext::default();
        scanctx.store_result("size", to_response(&SizeData { size: 100 }).unwrap());
        scanctx.changes = vec![
            Change {
                action: ActionType::Updated,
                from: file(20),
                to: file(50),
            },
            Change {
                action: ActionType::Deleted,
                from: file(30),
                to: None,
            },
        ];

        let response = SizeScanner.scan(&scanctx).await.unwrap();
        let data: SizeData = response.unpack().unwrap();
        assert_eq!(data.size, 100);
    }
}

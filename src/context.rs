//! Per-revision state shared with every analyzer of a pipeline traversal.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::envelope::{ScanResponse, TypedPayload};
use crate::error::EnvelopeError;
use crate::model::{Change, Commit, Snapshot};

/// The record passed to analyzers for each scanned revision.
///
/// One context lives for a whole traversal: `data` accumulates typed results
/// across revisions, so an analyzer sees what it (or an earlier step)
/// produced for the previous revision unless it overwrites its own entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanContext {
    pub commit: Commit,
    pub snapshot: Snapshot,
    pub changes: Vec<Change>,
    pub data: HashMap<String, ScanResponse>,
    #[serde(skip)]
    plugin_to_type: HashMap<String, String>,
}

impl ScanContext {
    /// Installs the next revision's view. Typed data carries over from the
    /// previous revision.
    pub fn advance(&mut self, commit: Commit, snapshot: Snapshot, changes: Vec<Change>) {
        self.commit = commit;
        self.snapshot = snapshot;
        self.changes = changes;
    }

    /// Reads a previously produced typed payload, failing with
    /// [`EnvelopeError::NoData`] when no analyzer has produced one yet.
    pub fn get_data<T: TypedPayload>(&self) -> Result<T, EnvelopeError> {
        let response = self.data.get(T::TYPE_NAME).ok_or(EnvelopeError::NoData)?;
        response.unpack()
    }

    /// Records an analyzer's result under its payload name, and remembers
    /// which payload type the analyzer produced first.
    pub fn store_result(&mut self, plugin_name: &str, response: ScanResponse) {
        self.plugin_to_type
            .entry(plugin_name.to_string())
            .or_insert_with(|| response.name.clone());
        self.data.insert(response.name.clone(), response);
    }

    /// The payload type name `plugin_name` produced on its first execution.
    pub fn produced_type(&self, plugin_name: &str) -> Option<&str> {
        self.plugin_to_type.get(plugin_name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::to_response;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Count {
        value: u32,
    }

    impl TypedPayload for Count {
        const TYPE_NAME: &'static str = "treport.test.Count";
    }

    #[test]
    fn test_get_data_misses_with_no_data() {
        let scanctx = ScanContext::default();
        assert!(matches!(
            scanctx.get_data::<Count>(),
            Err(EnvelopeError::NoData)
        ));
    }

    #[test]
    fn test_store_then_get() {
        let mut scanctx = ScanContext::default();
        scanctx.store_result("counter", to_response(&Count { value: 100 }).unwrap());

        let back: Count = scanctx.get_data().unwrap();
        assert_eq!(back, Count { value: 100 });
        assert_eq!(scanctx.produced_type("counter"), Some("treport.test.Count"));
    }

    #[test]
    fn test_first_produced_type_wins() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Second;
        impl TypedPayload for Second {
            const TYPE_NAME: &'static str = "treport.test.Second";
        }

        let mut scanctx = ScanContext::default();
        scanctx.store_result("counter", to_response(&Count { value: 1 }).unwrap());
        scanctx.store_result("counter", to_response(&Second).unwrap());

        assert_eq!(scanctx.produced_type("counter"), Some("treport.test.Count"));
        assert!(scanctx.data.contains_key("treport.test.Second"));
    }

    #[test]
    fn test_data_survives_advance() {
        let mut scanctx = ScanContext::default();
        scanctx.store_result("counter", to_response(&Count { value: 3 }).unwrap());
        scanctx.advance(Commit::default(), Snapshot::default(), Vec::new());

        let back: Count = scanctx.get_data().unwrap();
        assert_eq!(back.value, 3);
    }
}

//! Per-analyzer result cache keyed by revision hash.

use std::path::Path;

use tracing::debug;

use crate::envelope::ScanResponse;
use crate::error::CacheError;

/// Memoizes serialized envelopes for one analyzer within one plan node.
pub struct ResultCache {
    db: sled::Db,
}

impl ResultCache {
    /// Opens the backing store at `path`, creating parent directories as
    /// needed.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| CacheError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let db = sled::open(path).map_err(|source| CacheError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "opened result cache");
        Ok(Self { db })
    }

    /// The cached envelope for `revision`, or `None` when no entry exists.
    /// Store faults other than a missing key propagate.
    pub fn get(&self, revision: &str) -> Result<Option<ScanResponse>, CacheError> {
        let Some(bytes) = self.db.get(revision.as_bytes())? else {
            return Ok(None);
        };
        let response = bincode::deserialize(&bytes).map_err(|source| CacheError::Decode {
            revision: revision.to_string(),
            source,
        })?;
        Ok(Some(response))
    }

    /// Writes one entry, overwriting any previous value for `revision`.
    pub fn store(&self, revision: &str, response: &ScanResponse) -> Result<(), CacheError> {
        let bytes = bincode::serialize(response).map_err(|source| CacheError::Encode {
            revision: revision.to_string(),
            source,
        })?;
        self.db.insert(revision.as_bytes(), bytes)?;
        Ok(())
    }

    /// Flushes pending writes to disk; called during plan cleanup.
    pub fn flush(&self) -> Result<(), CacheError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::AnyValue;
    use tempfile::TempDir;

    fn sample(name: &str) -> ScanResponse {
        ScanResponse {
            name: name.to_string(),
            data: AnyValue {
                type_url: name.to_string(),
                value: vec![1, 2, 3],
            },
            json: "{}".to_string(),
        }
    }

    #[test]
    fn test_get_returns_none_for_missing_key() {
        let temp = TempDir::new().unwrap();
        let cache = ResultCache::open(&temp.path().join("store")).unwrap();
        assert!(cache.get("0000").unwrap().is_none());
    }

    #[test]
    fn test_store_then_get_round_trips() {
        let temp = TempDir::new().unwrap();
        let cache = ResultCache::open(&temp.path().join("store")).unwrap();

        let response = sample("treport.test.Sample");
        cache.store("abc123", &response).unwrap();

        let cached = cache.get("abc123").unwrap().unwrap();
        assert_eq!(cached, response);
    }

    #[test]
    fn test_open_creates_missing_parents() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a").join("b").join("store");
        let cache = ResultCache::open(&nested).unwrap();
        cache.store("k", &sample("s")).unwrap();
        cache.flush().unwrap();
        assert!(nested.exists());
    }
}

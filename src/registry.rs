//! Version registry tracking the last-seen build of each analyzer binary.
//!
//! Entries are JSON documents in an embedded store keyed by analyzer name.
//! Cache invalidation compares an analyzer's current binary mtime against
//! the recorded `last_updated_time`.

use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// One registry entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerVersion {
    pub name: String,
    pub version: u64,
    pub last_updated_time: DateTime<Utc>,
}

/// The backing store, one per mount point.
pub struct VersionRegistry {
    db: sled::Db,
}

impl VersionRegistry {
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| RegistryError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let db = sled::open(path).map_err(|source| RegistryError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { db })
    }

    /// True when no entry exists for `name`, or when `mtime` is strictly
    /// after the recorded `last_updated_time`.
    pub fn is_updated(&self, name: &str, mtime: SystemTime) -> Result<bool, RegistryError> {
        match self.read(name)? {
            None => Ok(true),
            Some(entry) => Ok(DateTime::<Utc>::from(mtime) > entry.last_updated_time),
        }
    }

    /// Inserts a first entry with version 1, or bumps the stored version and
    /// records the new mtime.
    pub fn update(&self, name: &str, mtime: SystemTime) -> Result<AnalyzerVersion, RegistryError> {
        let entry = match self.read(name)? {
            None => AnalyzerVersion {
                name: name.to_string(),
                version: 1,
                last_updated_time: DateTime::<Utc>::from(mtime),
            },
            Some(mut entry) => {
                entry.version += 1;
                entry.last_updated_time = DateTime::<Utc>::from(mtime);
                entry
            }
        };
        self.write(&entry)?;
        Ok(entry)
    }

    pub fn read(&self, name: &str) -> Result<Option<AnalyzerVersion>, RegistryError> {
        let Some(bytes) = self.db.get(name.as_bytes())? else {
            return Ok(None);
        };
        let entry = serde_json::from_slice(&bytes).map_err(|source| RegistryError::Decode {
            name: name.to_string(),
            source,
        })?;
        Ok(Some(entry))
    }

    fn write(&self, entry: &AnalyzerVersion) -> Result<(), RegistryError> {
        let bytes = serde_json::to_vec(entry).map_err(|source| RegistryError::Encode {
            name: entry.name.clone(),
            source,
        })?;
        self.db.insert(entry.name.as_bytes(), bytes)?;
        Ok(())
    }
}

//! Value types describing revisions, snapshots and per-revision deltas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Author or committer identity attached to a revision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub when: DateTime<Utc>,
}

/// An immutable revision of a repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    pub author: Signature,
    pub committer: Signature,
    pub pgp_signature: String,
    pub message: String,
    pub tree_hash: String,
    pub parent_hashes: Vec<String>,
}

pub type FileMode = u32;

/// A single blob reachable from a revision's tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub name: String,
    pub mode: FileMode,
    pub size: i64,
    pub hash: String,
}

/// The full set of files visible at one revision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub hash: String,
    pub entries: Vec<File>,
}

/// What happened to a file between two replayed revisions.
///
/// Serialized as its variant name, which is also the on-the-wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    Added,
    Deleted,
    Updated,
}

/// One file-level delta. `from` is present for `Deleted`/`Updated`, `to`
/// for `Added`/`Updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub action: ActionType,
    pub from: Option<File>,
    pub to: Option<File>,
}

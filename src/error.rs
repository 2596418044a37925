/// Domain-specific error types for treport using thiserror
///
/// Component modules return these structured errors so callers can match on
/// the failure kind; orchestration layers wrap them with `anyhow` context.
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for treport operations
#[derive(Error, Debug)]
pub enum TreportError {
    #[error("repository operation failed")]
    Repo(#[from] RepoError),

    #[error("analyzer operation failed")]
    Analyzer(#[from] AnalyzerError),

    #[error("cache operation failed")]
    Cache(#[from] CacheError),

    #[error("version registry operation failed")]
    Registry(#[from] RegistryError),

    #[error("configuration error")]
    Config(#[from] ConfigError),

    #[error("payload handling failed")]
    Envelope(#[from] EnvelopeError),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid repository path: {0:?}")]
    InvalidRepositoryPath(String),

    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Repository handle errors
#[derive(Error, Debug)]
pub enum RepoError {
    #[error("failed to open or clone repository {url}")]
    OpenOrClone {
        url: String,
        #[source]
        source: git2::Error,
    },

    #[error("no base branch configured for {path}")]
    NoBaseBranch { path: PathBuf },

    #[error("failed to sync repository onto {branch}")]
    Sync {
        branch: String,
        #[source]
        source: git2::Error,
    },

    #[error("history traversal failed")]
    Traversal(#[source] git2::Error),

    #[error("repository worker task failed")]
    Task(#[source] tokio::task::JoinError),

    #[error(transparent)]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Analyzer client and RPC errors
#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("failed to set up analyzer {name}")]
    Setup {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("analyzer {name} has not been set up")]
    NotStarted { name: String },

    #[error("handshake with analyzer {name} failed: {reason}")]
    Handshake { name: String, reason: String },

    #[error("scan rpc to analyzer {name} failed: {message}")]
    Rpc { name: String, message: String },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("failed to encode frame")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode frame")]
    Decode(#[source] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Typed envelope errors. `NoData` is visible to analyzers: it signals a
/// typed lookup miss rather than a fault.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("data doesn't exist")]
    NoData,

    #[error("payload type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("failed to encode payload {name}")]
    Encode {
        name: String,
        #[source]
        source: bincode::Error,
    },

    #[error("failed to decode payload {name}")]
    Decode {
        name: String,
        #[source]
        source: bincode::Error,
    },

    #[error("failed to render payload {name} as json")]
    Json {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Result cache errors. Key misses are not errors; `get` returns `None`.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("failed to create cache directory {path}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open result cache at {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: sled::Error,
    },

    #[error("failed to decode cached envelope for revision {revision}")]
    Decode {
        revision: String,
        #[source]
        source: bincode::Error,
    },

    #[error("failed to encode envelope for revision {revision}")]
    Encode {
        revision: String,
        #[source]
        source: bincode::Error,
    },

    #[error(transparent)]
    Io(#[from] sled::Error),
}

/// Version registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to create registry directory {path}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open version registry at {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: sled::Error,
    },

    #[error("failed to decode version entry for {name}")]
    Decode {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode version entry for {name}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] sled::Error),
}

//! YAML configuration model.
//!
//! The configuration names a mount point, declares external analyzers and
//! describes pipelines. Several fields accept shorthand forms: an analyzer
//! declaration may be a bare name, and a pipeline step may be a name, a list
//! of names, a single `{name, args}` object or a list of objects.

use std::env;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Repository URL assumed for analyzer declarations that name no source.
pub const TREPORT_REPO_URL: &str = "https://github.com/treport/treport";

static URL_MATCHER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^http?s://(.+)$").expect("valid url pattern"));

/// Root configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub plugin: PluginConfig,
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
}

impl Config {
    /// Loads and parses the YAML configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Root of all state this host manages.
    pub fn mount_path(&self) -> PathBuf {
        self.project.mount_path()
    }

    /// Where source and analyzer repositories are checked out.
    pub fn repo_path(&self) -> PathBuf {
        self.mount_path().join("repo")
    }

    /// Where per-analyzer result caches live.
    pub fn cache_path(&self) -> PathBuf {
        self.mount_path().join("cache")
    }

    /// Where analyzer bookkeeping (the version registry) lives.
    pub fn plugin_path(&self) -> PathBuf {
        self.mount_path().join("plugin")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl ProjectConfig {
    /// The configured mount point, defaulting to `$HOME/.treport.d`.
    pub fn mount_path(&self) -> PathBuf {
        match &self.path {
            Some(path) if !path.as_os_str().is_empty() => path.clone(),
            _ => PathBuf::from(env::var("HOME").unwrap_or_default()).join(".treport.d"),
        }
    }
}

/// External analyzer declarations.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginConfig {
    #[serde(default)]
    pub scanner: Vec<RepositoryConfig>,
    #[serde(default)]
    pub storer: Vec<RepositoryConfig>,
}

/// A repository declaration: a scanned source or an analyzer's home.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "RepositoryDecl")]
pub struct RepositoryConfig {
    pub name: String,
    pub repo: String,
    pub path: Option<String>,
    pub branch: Option<String>,
    pub rev: Option<String>,
    pub auth: Option<AuthConfig>,
}

impl RepositoryConfig {
    /// The checkout path relative to the mount: the host+path segment of the
    /// declared URL. Fails with [`ConfigError::InvalidRepositoryPath`] for
    /// anything that is not an http(s) URL.
    pub fn repo_path(&self) -> Result<String, ConfigError> {
        let captures = URL_MATCHER
            .captures(&self.repo)
            .ok_or_else(|| ConfigError::InvalidRepositoryPath(self.repo.clone()))?;
        Ok(captures[1].to_string())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RepositoryDecl {
    Name(String),
    Full {
        #[serde(default)]
        name: String,
        #[serde(default)]
        repo: String,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        branch: Option<String>,
        #[serde(default)]
        rev: Option<String>,
        #[serde(default)]
        auth: Option<AuthConfig>,
    },
}

impl From<RepositoryDecl> for RepositoryConfig {
    fn from(decl: RepositoryDecl) -> Self {
        match decl {
            RepositoryDecl::Name(name) => Self {
                name,
                repo: TREPORT_REPO_URL.to_string(),
                path: None,
                branch: None,
                rev: None,
                auth: None,
            },
            RepositoryDecl::Full {
                name,
                mut repo,
                path,
                branch,
                rev,
                auth,
            } => {
                if repo.is_empty() {
                    repo = TREPORT_REPO_URL.to_string();
                }
                Self {
                    name,
                    repo,
                    path,
                    branch,
                    rev,
                    auth,
                }
            }
        }
    }
}

/// Names the environment variables holding basic-auth credentials.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl AuthConfig {
    /// Resolved credentials, or `None` when either variable is unset or
    /// empty (no auth is sent in that case).
    pub fn basic_auth(&self) -> Option<BasicAuth> {
        let username = env::var(&self.user).unwrap_or_default();
        let password = env::var(&self.password).unwrap_or_default();
        if username.is_empty() || password.is_empty() {
            return None;
        }
        Some(BasicAuth { username, password })
    }
}

/// Plain basic-auth credentials resolved from the environment.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// Policy for choosing which revisions of a repository feed a pipeline.
///
/// Declarations naming any other strategy fail to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Strategy {
    AllMergeCommit,
    AllCommit,
    HeadOnly,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllMergeCommit => "allMergeCommit",
            Self::AllCommit => "allCommit",
            Self::HeadOnly => "headOnly",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default)]
    pub desc: String,
    pub strategy: Strategy,
    #[serde(default)]
    pub repository: Vec<RepositoryConfig>,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

/// One pipeline position: the analyzers that run concurrently there.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "StepDecl")]
pub struct StepConfig {
    pub analyzers: Vec<AnalyzerExecConfig>,
}

/// An analyzer reference inside a step.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzerExecConfig {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StepDecl {
    Name(String),
    Exec(AnalyzerExecConfig),
    Names(Vec<String>),
    Execs(Vec<AnalyzerExecConfig>),
}

impl From<StepDecl> for StepConfig {
    fn from(decl: StepDecl) -> Self {
        let analyzers = match decl {
            StepDecl::Name(name) => vec![AnalyzerExecConfig {
                name,
                args: Vec::new(),
            }],
            StepDecl::Exec(exec) => vec![exec],
            StepDecl::Names(names) => names
                .into_iter()
                .map(|name| AnalyzerExecConfig {
                    name,
                    args: Vec::new(),
                })
                .collect(),
            StepDecl::Execs(execs) => execs,
        };
        Self { analyzers }
    }
}

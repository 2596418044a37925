//! Analyzer catalog.
//!
//! Built-in analyzers are registered first; external `scanner` and `storer`
//! declarations are added unless a built-in already owns the name. One
//! [`Analyzer`] runtime exists per name and is shared by every step and
//! pipeline that references it.

pub mod serve;
pub mod size;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::OnceCell;
use tracing::debug;

use crate::client::AnalyzerClient;
use crate::config::{Config, RepositoryConfig};
use crate::error::{AnalyzerError, TreportError};
use crate::identity::hash_id;
use crate::repository::RepoHandle;

/// Analyzer names shipped with the host.
pub const BUILTIN_ANALYZER_NAMES: &[&str] = &["size"];

fn builtin_command(name: &str) -> PathBuf {
    PathBuf::from("./internal/plugins").join(name).join(name)
}

/// A catalogued analyzer: identity plus the lazily started subprocess
/// client.
pub struct Analyzer {
    pub name: String,
    /// sha1 of the analyzer's source repository path; a stable component of
    /// cache paths and pipeline IDs.
    pub source_repo_id: String,
    command: PathBuf,
    client: OnceCell<Arc<AnalyzerClient>>,
}

impl Analyzer {
    fn builtin(name: &str) -> Self {
        Self {
            name: name.to_string(),
            source_repo_id: hash_id(name),
            command: builtin_command(name),
            client: OnceCell::new(),
        }
    }

    fn external(decl: &RepositoryConfig, checkout: &Path, source_repo_id: String) -> Self {
        let binary = decl.path.clone().unwrap_or_else(|| decl.name.clone());
        Self {
            name: decl.name.clone(),
            source_repo_id,
            command: checkout.join(binary),
            client: OnceCell::new(),
        }
    }

    /// Identity-only analyzer for tests.
    #[cfg(test)]
    pub(crate) fn detached(name: &str, source_repo_id: &str) -> Self {
        Self {
            name: name.to_string(),
            source_repo_id: source_repo_id.to_string(),
            command: PathBuf::new(),
            client: OnceCell::new(),
        }
    }

    /// Pre-wired analyzer for tests; no subprocess is spawned.
    #[cfg(test)]
    pub(crate) fn with_client(
        name: &str,
        source_repo_id: &str,
        client: Arc<AnalyzerClient>,
    ) -> Self {
        Self {
            name: name.to_string(),
            source_repo_id: source_repo_id.to_string(),
            command: PathBuf::new(),
            client: OnceCell::new_with(Some(client)),
        }
    }

    /// Starts the analyzer subprocess and performs the handshake. An
    /// analyzer referenced from several steps or pipelines is spawned once;
    /// the first caller's args win.
    pub async fn setup(&self, args: &[String]) -> Result<(), AnalyzerError> {
        self.client
            .get_or_try_init(|| async {
                debug!(analyzer = %self.name, command = %self.command.display(), "starting analyzer");
                let client = AnalyzerClient::spawn(&self.name, &self.command, args).await?;
                Ok::<_, AnalyzerError>(Arc::new(client))
            })
            .await?;
        Ok(())
    }

    /// The running client; `setup` must have succeeded first.
    pub fn client(&self) -> Result<Arc<AnalyzerClient>, AnalyzerError> {
        self.client
            .get()
            .cloned()
            .ok_or_else(|| AnalyzerError::NotStarted {
                name: self.name.clone(),
            })
    }

    /// Binary mtime recorded at setup time.
    pub fn mtime(&self) -> Option<SystemTime> {
        self.client.get().map(|client| client.mtime())
    }

    pub async fn stop(&self) {
        if let Some(client) = self.client.get() {
            client.stop().await;
        }
    }
}

/// All analyzers known to one scan run, keyed by name.
pub struct Catalog {
    analyzers: HashMap<String, Arc<Analyzer>>,
}

impl Catalog {
    /// Registers built-ins, then clones or opens each external declaration's
    /// source repository under the mount to derive its stable ID.
    pub async fn build(config: &Config) -> Result<Self, TreportError> {
        let mut analyzers = HashMap::new();
        for name in BUILTIN_ANALYZER_NAMES {
            analyzers.insert((*name).to_string(), Arc::new(Analyzer::builtin(name)));
        }

        let declarations = config.plugin.scanner.iter().chain(&config.plugin.storer);
        for decl in declarations {
            if analyzers.contains_key(&decl.name) {
                continue;
            }
            let repo = RepoHandle::open_or_clone(&config.repo_path(), decl).await?;
            let analyzer = Analyzer::external(decl, repo.path(), repo.id().to_string());
            analyzers.insert(decl.name.clone(), Arc::new(analyzer));
        }
        Ok(Self { analyzers })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Analyzer>> {
        self.analyzers.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Analyzer>> {
        self.analyzers.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_command_layout() {
        assert_eq!(
            builtin_command("size"),
            PathBuf::from("./internal/plugins/size/size")
        );
    }

    #[test]
    fn test_builtin_source_repo_id_is_name_hash() {
        let analyzer = Analyzer::builtin("size");
        assert_eq!(
            analyzer.source_repo_id,
            "89368e1d68015693ab48ee189d0632cb5d6edfb3"
        );
        assert!(analyzer.mtime().is_none());
        assert!(matches!(
            analyzer.client(),
            Err(AnalyzerError::NotStarted { .. })
        ));
    }
}

//! Materializes the declarative configuration into a runnable plan.
//!
//! A plan is a tree: pipelines hold repositories, repositories hold the
//! ordered steps, steps hold references to shared analyzer runtimes. Every
//! node carries a cache path derived purely from content IDs, so rebuilding
//! the plan from the same configuration reproduces the same filesystem
//! layout.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::OnceCell;
use tracing::{debug, info};

use crate::cache::ResultCache;
use crate::config::{Config, PipelineConfig, Strategy};
use crate::error::CacheError;
use crate::identity::hash_id;
use crate::plugin::{Analyzer, Catalog};
use crate::registry::VersionRegistry;
use crate::repository::RepoHandle;

/// All pipelines of one scan run plus the analyzer catalog backing them.
pub struct Plan {
    pub pipelines: Vec<Arc<Pipeline>>,
    catalog: Catalog,
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("pipelines", &self.pipelines.len())
            .finish()
    }
}

pub struct Pipeline {
    /// sha1 over the strategy and the per-step sorted analyzer IDs.
    pub id: String,
    pub name: String,
    pub strategy: Strategy,
    pub cache_path: PathBuf,
    pub repos: Vec<Arc<PipelineRepository>>,
}

pub struct PipelineRepository {
    pub repo: Arc<RepoHandle>,
    pub cache_path: PathBuf,
    pub steps: Vec<Step>,
}

pub struct Step {
    pub idx: usize,
    pub cache_path: PathBuf,
    pub analyzers: Vec<PlanAnalyzer>,
}

/// A step's reference to a shared analyzer runtime, carrying this plan
/// node's cache location and its lazily opened handle.
pub struct PlanAnalyzer {
    pub runtime: Arc<Analyzer>,
    pub cache_path: PathBuf,
    cache: OnceCell<ResultCache>,
}

impl PlanAnalyzer {
    pub(crate) fn new(runtime: Arc<Analyzer>) -> Self {
        Self {
            runtime,
            cache_path: PathBuf::new(),
            cache: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.runtime.name
    }

    /// Opens the result cache on first use.
    pub fn cache(&self) -> Result<&ResultCache, CacheError> {
        self.cache.get_or_try_init(|| ResultCache::open(&self.cache_path))
    }

    fn cache_if_open(&self) -> Option<&ResultCache> {
        self.cache.get()
    }
}

impl Plan {
    /// Resolves the configuration into pipelines with stable IDs and cache
    /// paths, sets up every referenced analyzer and applies the cache
    /// invalidation cascade.
    pub async fn build(config: &Config) -> Result<Plan> {
        let catalog = Catalog::build(config)
            .await
            .context("failed to build analyzer catalog")?;
        let registry = VersionRegistry::open(&config.plugin_path().join("version"))
            .context("failed to open plugin version registry")?;

        let mut pipelines = Vec::with_capacity(config.pipelines.len());
        for pipeline_cfg in &config.pipelines {
            let pipeline = build_pipeline(config, &catalog, pipeline_cfg)
                .await
                .with_context(|| format!("failed to build pipeline {}", pipeline_cfg.name))?;
            invalidate_stale_caches(&pipeline, &registry)?;
            pipelines.push(Arc::new(pipeline));
        }
        Ok(Plan { pipelines, catalog })
    }

    /// Stops every analyzer subprocess and flushes open caches. Runs on
    /// every exit path of the orchestrator.
    pub async fn cleanup(&self) {
        for pipeline in &self.pipelines {
            for repo in &pipeline.repos {
                for step in &repo.steps {
                    for analyzer in &step.analyzers {
                        if let Some(cache) = analyzer.cache_if_open() {
                            if let Err(err) = cache.flush() {
                                tracing::warn!(
                                    analyzer = analyzer.name(),
                                    error = %err,
                                    "failed to flush result cache"
                                );
                            }
                        }
                    }
                }
            }
        }
        for analyzer in self.catalog.iter() {
            analyzer.stop().await;
        }
    }
}

async fn build_pipeline(
    config: &Config,
    catalog: &Catalog,
    pipeline_cfg: &PipelineConfig,
) -> Result<Pipeline> {
    let mut repos = Vec::with_capacity(pipeline_cfg.repository.len());
    for repo_cfg in &pipeline_cfg.repository {
        let repo = RepoHandle::open_or_clone(&config.repo_path(), repo_cfg)
            .await
            .with_context(|| format!("failed to open repository {}", repo_cfg.repo))?;

        let mut steps = Vec::with_capacity(pipeline_cfg.steps.len());
        for (idx, step_cfg) in pipeline_cfg.steps.iter().enumerate() {
            let mut analyzers = Vec::with_capacity(step_cfg.analyzers.len());
            for exec in &step_cfg.analyzers {
                let runtime = catalog
                    .get(&exec.name)
                    .ok_or_else(|| anyhow!("no analyzer named {:?}", exec.name))?;
                runtime
                    .setup(&exec.args)
                    .await
                    .with_context(|| format!("failed to set up analyzer {}", exec.name))?;
                analyzers.push(PlanAnalyzer::new(runtime));
            }
            steps.push(Step {
                idx,
                cache_path: PathBuf::new(),
                analyzers,
            });
        }
        repos.push(PipelineRepository {
            repo,
            cache_path: PathBuf::new(),
            steps,
        });
    }

    // Every repository of a pipeline shares the declared step list, so the
    // first repository's steps determine the pipeline ID.
    let id = pipeline_id(
        pipeline_cfg.strategy,
        repos.first().map(|repo| repo.steps.as_slice()).unwrap_or_default(),
    );
    let cache_path = config.cache_path().join(&id);

    for repo in &mut repos {
        repo.cache_path = cache_path.join(repo.repo.id());
        for step in &mut repo.steps {
            step.cache_path = repo.cache_path.join(format!("{:03}", step.idx));
            for analyzer in &mut step.analyzers {
                analyzer.cache_path = step.cache_path.join(&analyzer.runtime.source_repo_id);
            }
        }
    }

    Ok(Pipeline {
        id,
        name: pipeline_cfg.name.clone(),
        strategy: pipeline_cfg.strategy,
        cache_path,
        repos: repos.into_iter().map(Arc::new).collect(),
    })
}

/// sha1 hex of `strategy:id:id:…` where each step contributes its analyzer
/// source-repo IDs in lexicographic order, steps in declaration order.
fn pipeline_id(strategy: Strategy, steps: &[Step]) -> String {
    let mut parts = vec![strategy.as_str().to_string()];
    for step in steps {
        let mut ids: Vec<String> = step
            .analyzers
            .iter()
            .map(|analyzer| analyzer.runtime.source_repo_id.clone())
            .collect();
        ids.sort();
        parts.extend(ids);
    }
    hash_id(&parts.join(":"))
}

/// Walks each repository's steps in order. An updated analyzer invalidates
/// its own cache and forces deletion of every later step's cache in that
/// repository; earlier steps and other repositories stay intact.
fn invalidate_stale_caches(pipeline: &Pipeline, registry: &VersionRegistry) -> Result<()> {
    for repo in &pipeline.repos {
        let mut delete_downstream = false;
        for step in &repo.steps {
            if delete_downstream {
                remove_cache_dir(&step.cache_path)?;
                continue;
            }
            for analyzer in &step.analyzers {
                let Some(mtime) = analyzer.runtime.mtime() else {
                    continue;
                };
                if registry.is_updated(analyzer.name(), mtime)? {
                    remove_cache_dir(&analyzer.cache_path)?;
                    delete_downstream = true;
                    let entry = registry.update(analyzer.name(), mtime)?;
                    info!(
                        analyzer = analyzer.name(),
                        version = entry.version,
                        "analyzer binary updated, cache invalidated"
                    );
                }
            }
        }
    }
    Ok(())
}

fn remove_cache_dir(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        debug!(path = %path.display(), "deleting stale cache");
        std::fs::remove_dir_all(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::AnalyzerClient;
    use crate::config::Config;
    use crate::error::{ConfigError, TreportError};
    use std::fs;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    async fn client_with_mtime(name: &str, mtime: SystemTime) -> Arc<AnalyzerClient> {
        let (host_side, analyzer_side) = tokio::io::duplex(1024);
        let (host_read, host_write) = tokio::io::split(host_side);
        let (_analyzer_read, mut analyzer_write) = tokio::io::split(analyzer_side);
        analyzer_write.write_all(b"1\n").await.unwrap();
        // Keep the analyzer half alive for the duration of the test.
        std::mem::forget(_analyzer_read);
        std::mem::forget(analyzer_write);
        Arc::new(
            AnalyzerClient::from_streams(name, mtime, host_read, host_write)
                .await
                .unwrap(),
        )
    }

    fn analyzer_node(runtime: Arc<Analyzer>, cache_path: PathBuf) -> PlanAnalyzer {
        PlanAnalyzer {
            runtime,
            cache_path,
            cache: OnceCell::new(),
        }
    }

    fn seed_dir(path: &Path) {
        fs::create_dir_all(path).unwrap();
        fs::write(path.join("entry"), b"cached").unwrap();
    }

    #[test]
    fn test_pipeline_id_matches_derivation() {
        let runtime = Arc::new(Analyzer::detached("size", "89368e1d68015693ab48ee189d0632cb5d6edfb3"));
        let steps = vec![Step {
            idx: 0,
            cache_path: PathBuf::new(),
            analyzers: vec![analyzer_node(runtime, PathBuf::new())],
        }];

        let id = pipeline_id(Strategy::HeadOnly, &steps);
        assert_eq!(id, "35a042e3ead67d727f2bedff90931c920651515c");
        assert_eq!(id, pipeline_id(Strategy::HeadOnly, &steps));
    }

    #[test]
    fn test_pipeline_id_sorts_analyzers_within_step() {
        let a = Arc::new(Analyzer::detached("a", "bbbb"));
        let b = Arc::new(Analyzer::detached("b", "aaaa"));

        let forward = vec![Step {
            idx: 0,
            cache_path: PathBuf::new(),
            analyzers: vec![
                analyzer_node(Arc::clone(&a), PathBuf::new()),
                analyzer_node(Arc::clone(&b), PathBuf::new()),
            ],
        }];
        let reversed = vec![Step {
            idx: 0,
            cache_path: PathBuf::new(),
            analyzers: vec![analyzer_node(b, PathBuf::new()), analyzer_node(a, PathBuf::new())],
        }];

        assert_eq!(
            pipeline_id(Strategy::AllCommit, &forward),
            pipeline_id(Strategy::AllCommit, &reversed)
        );
        assert_eq!(
            pipeline_id(Strategy::AllCommit, &forward),
            hash_id("allCommit:aaaa:bbbb")
        );
    }

    #[tokio::test]
    async fn test_invalid_repository_url_fails_plan_build() {
        let temp = TempDir::new().unwrap();
        let yaml = format!(
            r#"
project:
  path: {}
pipelines:
  - name: broken
    strategy: headOnly
    repository:
      - repo: "git@github.com:foo/bar.git"
    steps: []
"#,
            temp.path().display()
        );
        let config: Config = serde_yaml::from_str(&yaml).unwrap();

        let err = Plan::build(&config).await.unwrap_err();
        let invalid = err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<TreportError>(),
                Some(TreportError::Config(ConfigError::InvalidRepositoryPath(path)))
                    if path == "git@github.com:foo/bar.git"
            )
        });
        assert!(invalid, "unexpected error chain: {err:?}");
    }

    #[tokio::test]
    async fn test_invalidation_cascades_downstream_only() {
        let temp = TempDir::new().unwrap();
        let repo_cache = temp.path().join("cache").join("pid").join("rid");
        let step0 = repo_cache.join("000");
        let step1 = repo_cache.join("001");
        let a_cache = step0.join("aaaa");
        let c_cache = step0.join("cccc");
        let b_cache = step1.join("bbbb");

        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let a = Arc::new(Analyzer::with_client(
            "a",
            "aaaa",
            client_with_mtime("a", t0).await,
        ));
        let c = Arc::new(Analyzer::with_client(
            "c",
            "cccc",
            client_with_mtime("c", t0).await,
        ));
        let b = Arc::new(Analyzer::with_client(
            "b",
            "bbbb",
            client_with_mtime("b", t0).await,
        ));

        let make_pipeline = |a: &Arc<Analyzer>, c: &Arc<Analyzer>, b: &Arc<Analyzer>| Pipeline {
            id: "pid".into(),
            name: "test".into(),
            strategy: Strategy::HeadOnly,
            cache_path: temp.path().join("cache").join("pid"),
            repos: vec![Arc::new(PipelineRepository {
                repo: RepoHandle::local(temp.path()),
                cache_path: repo_cache.clone(),
                steps: vec![
                    Step {
                        idx: 0,
                        cache_path: step0.clone(),
                        analyzers: vec![
                            analyzer_node(Arc::clone(a), a_cache.clone()),
                            analyzer_node(Arc::clone(c), c_cache.clone()),
                        ],
                    },
                    Step {
                        idx: 1,
                        cache_path: step1.clone(),
                        analyzers: vec![analyzer_node(Arc::clone(b), b_cache.clone())],
                    },
                ],
            })],
        };

        let registry = VersionRegistry::open(&temp.path().join("version")).unwrap();

        // First run: nothing recorded yet, so everything is invalidated.
        seed_dir(&a_cache);
        seed_dir(&c_cache);
        seed_dir(&b_cache);
        invalidate_stale_caches(&make_pipeline(&a, &c, &b), &registry).unwrap();
        assert!(!a_cache.exists());
        assert!(!step1.exists());
        assert_eq!(registry.read("a").unwrap().unwrap().version, 1);
        assert_eq!(registry.read("c").unwrap().unwrap().version, 1);

        // Second run with unchanged binaries: step-0 caches survive. `b` was
        // wiped with its whole step last time before being examined, so its
        // first version check happens now and invalidates it once.
        seed_dir(&a_cache);
        seed_dir(&c_cache);
        seed_dir(&b_cache);
        invalidate_stale_caches(&make_pipeline(&a, &c, &b), &registry).unwrap();
        assert!(a_cache.exists());
        assert!(c_cache.exists());
        assert!(!b_cache.exists());
        assert_eq!(registry.read("b").unwrap().unwrap().version, 1);

        // A further run leaves everything alone.
        seed_dir(&b_cache);
        invalidate_stale_caches(&make_pipeline(&a, &c, &b), &registry).unwrap();
        assert!(a_cache.exists());
        assert!(b_cache.exists());

        // Third run after rebuilding analyzer `a`: its cache and every later
        // step go; its step-0 peer stays.
        let a2 = Arc::new(Analyzer::with_client(
            "a",
            "aaaa",
            client_with_mtime("a", t0 + Duration::from_secs(60)).await,
        ));
        invalidate_stale_caches(&make_pipeline(&a2, &c, &b), &registry).unwrap();
        assert!(!a_cache.exists());
        assert!(c_cache.exists());
        assert!(!step1.exists());
        assert_eq!(registry.read("a").unwrap().unwrap().version, 2);
        assert_eq!(registry.read("c").unwrap().unwrap().version, 1);
    }
}

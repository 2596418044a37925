//! Scan orchestrator.
//!
//! Three nested fail-fast task groups: pipelines, repositories within a
//! pipeline, analyzers within a step. Steps inside a repository run
//! strictly in order because later analyzers may consume typed data
//! produced by earlier ones. The first error cancels peers through a shared
//! flag checked at revision boundaries; every group joins all outstanding
//! tasks before returning, and cleanup runs on every exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::client::ScanService;
use crate::config::{Config, Strategy};
use crate::context::ScanContext;
use crate::plan::{Pipeline, PipelineRepository, Plan, PlanAnalyzer};

/// Runs every configured pipeline against its repositories.
pub struct Scanner {
    config: Config,
}

impl Scanner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Builds the plan and drives it to completion. Analyzer subprocesses
    /// and cache handles are released whether or not the scan succeeds.
    pub async fn scan(&self) -> Result<()> {
        let mount = self.config.mount_path();
        tokio::fs::create_dir_all(&mount)
            .await
            .with_context(|| format!("failed to create mount point {}", mount.display()))?;

        let plan = Plan::build(&self.config)
            .await
            .context("failed to create pipelines")?;
        let result = run_pipelines(&plan).await;
        plan.cleanup().await;
        result
    }
}

/// Shared cancellation signal: set on the first failure, observed by every
/// traversal loop at revision boundaries.
#[derive(Clone, Default)]
struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

async fn run_pipelines(plan: &Plan) -> Result<()> {
    let cancel = CancelFlag::default();
    let mut group = JoinSet::new();
    for pipeline in &plan.pipelines {
        let pipeline = Arc::clone(pipeline);
        let cancel = cancel.clone();
        group.spawn(async move { run_pipeline(pipeline, cancel).await });
    }
    join_fail_fast(group, &cancel).await
}

async fn run_pipeline(pipeline: Arc<Pipeline>, cancel: CancelFlag) -> Result<()> {
    info!(pipeline = %pipeline.name, id = %pipeline.id, "running pipeline");
    let mut group = JoinSet::new();
    for repo in &pipeline.repos {
        let repo = Arc::clone(repo);
        let strategy = pipeline.strategy;
        let cancel = cancel.clone();
        group.spawn(async move { run_repository(repo, strategy, cancel).await });
    }
    join_fail_fast(group, &cancel).await
}

async fn run_repository(
    repo: Arc<PipelineRepository>,
    strategy: Strategy,
    cancel: CancelFlag,
) -> Result<()> {
    for step_idx in 0..repo.steps.len() {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let mut group = JoinSet::new();
        for analyzer_idx in 0..repo.steps[step_idx].analyzers.len() {
            let repo = Arc::clone(&repo);
            let cancel = cancel.clone();
            group.spawn(async move {
                let analyzer = &repo.steps[step_idx].analyzers[analyzer_idx];
                run_analyzer(&repo, analyzer, strategy, &cancel)
                    .await
                    .with_context(|| format!("failed to scan by {}", analyzer.name()))
            });
        }
        join_fail_fast(group, &cancel).await?;
    }
    Ok(())
}

/// Joins every task in the group. The first failure flips the shared cancel
/// flag so peers stop at their next revision boundary; all tasks are still
/// awaited before the error is returned.
async fn join_fail_fast(mut group: JoinSet<Result<()>>, cancel: &CancelFlag) -> Result<()> {
    let mut first_error = None;
    while let Some(joined) = group.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = result {
            if first_error.is_none() {
                cancel.cancel();
                first_error = Some(err);
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Per-analyzer workflow: sync the repository onto its base branch, replay
/// the strategy's revisions and serve each one from cache or a scan RPC.
async fn run_analyzer(
    repo: &PipelineRepository,
    analyzer: &PlanAnalyzer,
    strategy: Strategy,
    cancel: &CancelFlag,
) -> Result<()> {
    let branch = repo.repo.base_branch().await?;
    repo.repo
        .sync(&branch.merge)
        .await
        .context("failed to sync repository")?;
    let frames = repo.repo.frames(strategy).await?;

    let client = analyzer.runtime.client()?;
    let mut scanctx = ScanContext::default();
    for frame in frames {
        if cancel.is_cancelled() {
            return Ok(());
        }
        scanctx.advance(frame.commit, frame.snapshot, frame.changes);
        scan_revision(analyzer, client.as_ref(), &mut scanctx).await?;
    }
    Ok(())
}

/// A cache hit installs the stored envelope without touching the analyzer;
/// a miss issues the RPC and memoizes its result.
async fn scan_revision(
    analyzer: &PlanAnalyzer,
    service: &dyn ScanService,
    scanctx: &mut ScanContext,
) -> Result<()> {
    let cache = analyzer.cache()?;
    let revision = scanctx.commit.hash.clone();

    if let Some(cached) = cache.get(&revision)? {
        debug!(analyzer = analyzer.name(), revision = %revision, "cache hit");
        scanctx.store_result(analyzer.name(), cached);
        return Ok(());
    }

    let response = service.scan(scanctx).await?;
    cache.store(&revision, &response)?;
    Ok(())
}

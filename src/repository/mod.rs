//! Repository handles: clone-or-open, branch discovery, synchronization and
//! the three history-walk strategies.
//!
//! All libgit2 work runs on blocking worker threads; a handle never keeps a
//! `git2::Repository` open across calls, so one handle can serve concurrent
//! analyzer tasks once `sync` has completed.

mod convert;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{AuthConfig, BasicAuth, RepositoryConfig, Strategy};
use crate::error::{RepoError, TreportError};
use crate::identity::hash_id;
use crate::model::{Change, Commit, Snapshot};
use convert::{diff_changes, to_commit, to_snapshot};

/// Branch settings read from the repository configuration.
#[derive(Debug, Clone)]
pub struct BranchConfig {
    pub name: String,
    pub remote: String,
    /// Fully qualified ref the branch merges from, e.g. `refs/heads/main`.
    pub merge: String,
}

/// One replayed revision: the commit, its full tree snapshot and the delta
/// against the previously replayed tree.
#[derive(Debug, Clone)]
pub struct RevisionFrame {
    pub commit: Commit,
    pub snapshot: Snapshot,
    pub changes: Vec<Change>,
}

/// Handle to a repository checked out under the mount point.
pub struct RepoHandle {
    id: String,
    path: PathBuf,
    url: String,
    auth: Option<BasicAuth>,
    fetched: Mutex<bool>,
}

impl RepoHandle {
    /// Clones the declared remote under `mount/<host-path>`, or opens the
    /// checkout left behind by a previous run.
    pub async fn open_or_clone(
        mount: &Path,
        config: &RepositoryConfig,
    ) -> Result<Arc<Self>, TreportError> {
        let relative = config.repo_path()?;
        let path = mount.join(relative);
        let url = config.repo.clone();
        let auth = config.auth.as_ref().and_then(AuthConfig::basic_auth);

        {
            let path = path.clone();
            let url = url.clone();
            let auth = auth.clone();
            run_blocking(move || open_or_clone_blocking(&path, &url, auth.as_ref())).await?;
        }

        Ok(Arc::new(Self {
            id: hash_id(&path.to_string_lossy()),
            path,
            url,
            auth,
            fetched: Mutex::new(false),
        }))
    }

    /// Stable ID of this checkout: sha1 of its local path.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The branch named by `init.defaultBranch`, or the only configured
    /// branch; fails with [`RepoError::NoBaseBranch`] otherwise.
    pub async fn base_branch(self: &Arc<Self>) -> Result<BranchConfig, RepoError> {
        let this = Arc::clone(self);
        run_blocking(move || {
            let repo = this.open_repo()?;
            base_branch_blocking(&repo, &this.path)
        })
        .await
    }

    /// Brings the checkout up to date and puts `branch_ref` on disk.
    ///
    /// The first call per handle fetches every remote ref; later calls only
    /// repeat the checkout and fast-forward pull. Up-to-date fetches and
    /// pulls are not errors. Concurrent callers are serialized.
    pub async fn sync(self: &Arc<Self>, branch_ref: &str) -> Result<(), RepoError> {
        let mut fetched = self.fetched.lock().await;
        let this = Arc::clone(self);
        let branch = branch_ref.to_string();
        let do_fetch = !*fetched;
        run_blocking(move || this.sync_blocking(&branch, do_fetch)).await?;
        *fetched = true;
        Ok(())
    }

    /// The ordered revision stream for `strategy`.
    pub async fn frames(self: &Arc<Self>, strategy: Strategy) -> Result<Vec<RevisionFrame>, RepoError> {
        match strategy {
            Strategy::HeadOnly => self.head_only().await,
            Strategy::AllCommit => self.all_commits().await,
            Strategy::AllMergeCommit => self.all_merge_commits().await,
        }
    }

    /// A single frame for the newest commit in committer-time order, with an
    /// empty change list. An empty repository yields no frames.
    pub async fn head_only(self: &Arc<Self>) -> Result<Vec<RevisionFrame>, RepoError> {
        let this = Arc::clone(self);
        run_blocking(move || {
            let repo = this.open_repo()?;
            head_only_blocking(&repo).map_err(RepoError::Traversal)
        })
        .await
    }

    /// Replays every commit oldest to newest. The root commit only provides
    /// the baseline tree; each later commit carries the delta against the
    /// previously replayed tree.
    pub async fn all_commits(self: &Arc<Self>) -> Result<Vec<RevisionFrame>, RepoError> {
        let this = Arc::clone(self);
        run_blocking(move || {
            let repo = this.open_repo()?;
            all_commits_blocking(&repo).map_err(RepoError::Traversal)
        })
        .await
    }

    /// Replays only merge commits whose non-first parent is referenced under
    /// `refs/heads/pull/…`, i.e. pull-request merges.
    pub async fn all_merge_commits(self: &Arc<Self>) -> Result<Vec<RevisionFrame>, RepoError> {
        let this = Arc::clone(self);
        run_blocking(move || {
            let repo = this.open_repo()?;
            all_merge_commits_blocking(&repo).map_err(RepoError::Traversal)
        })
        .await
    }

    fn open_repo(&self) -> Result<git2::Repository, RepoError> {
        git2::Repository::open(&self.path).map_err(|source| RepoError::OpenOrClone {
            url: self.url.clone(),
            source,
        })
    }

    fn sync_blocking(&self, branch_ref: &str, fetch: bool) -> Result<(), RepoError> {
        let repo = self.open_repo()?;
        if fetch {
            let base = base_branch_blocking(&repo, &self.path)?;
            debug!(repo = %self.path.display(), remote = %base.remote, "fetching all refs");
            fetch_all(&repo, &base.remote, self.auth.as_ref()).map_err(|source| {
                RepoError::Sync {
                    branch: branch_ref.to_string(),
                    source,
                }
            })?;
        }
        checkout_and_pull(&repo, branch_ref, self.auth.as_ref()).map_err(|source| {
            RepoError::Sync {
                branch: branch_ref.to_string(),
                source,
            }
        })
    }

    /// Local-path handle for tests; no remote is involved.
    #[cfg(test)]
    pub(crate) fn local(path: &Path) -> Arc<Self> {
        Arc::new(Self {
            id: hash_id(&path.to_string_lossy()),
            path: path.to_path_buf(),
            url: path.to_string_lossy().into_owned(),
            auth: None,
            fetched: Mutex::new(false),
        })
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, RepoError>
where
    F: FnOnce() -> Result<T, RepoError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(err) => Err(RepoError::Task(err)),
    }
}

fn open_or_clone_blocking(
    path: &Path,
    url: &str,
    auth: Option<&BasicAuth>,
) -> Result<(), RepoError> {
    if path.exists() {
        git2::Repository::open(path).map_err(|source| RepoError::OpenOrClone {
            url: url.to_string(),
            source,
        })?;
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    info!(url, path = %path.display(), "cloning repository");
    git2::build::RepoBuilder::new()
        .fetch_options(fetch_options(auth))
        .clone(url, path)
        .map_err(|source| RepoError::OpenOrClone {
            url: url.to_string(),
            source,
        })?;
    Ok(())
}

fn fetch_options(auth: Option<&BasicAuth>) -> git2::FetchOptions<'static> {
    let mut callbacks = git2::RemoteCallbacks::new();
    if let Some(auth) = auth {
        let auth = auth.clone();
        callbacks.credentials(move |_url, _username, _allowed| {
            git2::Cred::userpass_plaintext(&auth.username, &auth.password)
        });
    }
    let mut options = git2::FetchOptions::new();
    options.remote_callbacks(callbacks);
    options
}

fn base_branch_blocking(
    repo: &git2::Repository,
    path: &Path,
) -> Result<BranchConfig, RepoError> {
    let config = repo.config()?.snapshot()?;
    if let Ok(name) = config.get_string("init.defaultBranch") {
        if !name.is_empty() {
            return branch_config(&config, &name, path);
        }
    }
    let mut names = configured_branches(&config)?;
    if names.len() != 1 {
        return Err(RepoError::NoBaseBranch {
            path: path.to_path_buf(),
        });
    }
    branch_config(&config, &names.remove(0), path)
}

fn configured_branches(config: &git2::Config) -> Result<Vec<String>, RepoError> {
    let mut names = Vec::new();
    let mut entries = config.entries(Some("branch\\..*\\.merge"))?;
    while let Some(entry) = entries.next() {
        let entry = entry?;
        if let Some(name) = entry.name() {
            if let Some(branch) = name
                .strip_prefix("branch.")
                .and_then(|rest| rest.strip_suffix(".merge"))
            {
                names.push(branch.to_string());
            }
        }
    }
    Ok(names)
}

fn branch_config(
    config: &git2::Config,
    name: &str,
    path: &Path,
) -> Result<BranchConfig, RepoError> {
    let remote = config.get_string(&format!("branch.{name}.remote"));
    let merge = config.get_string(&format!("branch.{name}.merge"));
    match (remote, merge) {
        (Ok(remote), Ok(merge)) => Ok(BranchConfig {
            name: name.to_string(),
            remote,
            merge,
        }),
        _ => Err(RepoError::NoBaseBranch {
            path: path.to_path_buf(),
        }),
    }
}

fn fetch_all(
    repo: &git2::Repository,
    remote_name: &str,
    auth: Option<&BasicAuth>,
) -> Result<(), git2::Error> {
    let mut remote = repo.find_remote(remote_name)?;
    let refspecs = ["+refs/*:refs/heads/*", "HEAD:refs/heads/HEAD"];
    remote.fetch(&refspecs, Some(&mut fetch_options(auth)), None)
}

/// Checks out `branch_ref` and fast-forwards it from its remote. Non
/// fast-forward divergence is left alone; an up-to-date branch is a no-op.
fn checkout_and_pull(
    repo: &git2::Repository,
    branch_ref: &str,
    auth: Option<&BasicAuth>,
) -> Result<(), git2::Error> {
    repo.set_head(branch_ref)?;
    let mut checkout = git2::build::CheckoutBuilder::new();
    checkout.force();
    repo.checkout_head(Some(&mut checkout))?;

    let branch_name = branch_ref.strip_prefix("refs/heads/").unwrap_or(branch_ref);
    let remote_name = repo
        .config()
        .and_then(|config| config.get_string(&format!("branch.{branch_name}.remote")))
        .unwrap_or_else(|_| "origin".to_string());
    let Ok(mut remote) = repo.find_remote(&remote_name) else {
        return Ok(());
    };
    remote.fetch(&[branch_ref], Some(&mut fetch_options(auth)), None)?;

    let Ok(fetch_head) = repo.find_reference("FETCH_HEAD") else {
        return Ok(());
    };
    let annotated = repo.reference_to_annotated_commit(&fetch_head)?;
    let (analysis, _) = repo.merge_analysis(&[&annotated])?;
    if analysis.is_up_to_date() {
        return Ok(());
    }
    if analysis.is_fast_forward() {
        let mut reference = repo.find_reference(branch_ref)?;
        reference.set_target(annotated.id(), "fast-forward")?;
        repo.set_head(branch_ref)?;
        let mut checkout = git2::build::CheckoutBuilder::new();
        checkout.force();
        repo.checkout_head(Some(&mut checkout))?;
    }
    Ok(())
}

/// All commit IDs reachable from HEAD, newest first by commit time. An
/// unborn HEAD yields an empty list.
fn commits_by_time(repo: &git2::Repository) -> Result<Vec<git2::Oid>, git2::Error> {
    let mut walk = repo.revwalk()?;
    if let Err(err) = walk.push_head() {
        if matches!(
            err.code(),
            git2::ErrorCode::UnbornBranch | git2::ErrorCode::NotFound
        ) {
            return Ok(Vec::new());
        }
        return Err(err);
    }
    walk.set_sorting(git2::Sort::TIME)?;
    walk.collect()
}

fn head_only_blocking(repo: &git2::Repository) -> Result<Vec<RevisionFrame>, git2::Error> {
    let oids = commits_by_time(repo)?;
    let Some(&head) = oids.first() else {
        return Ok(Vec::new());
    };
    let commit = repo.find_commit(head)?;
    let tree = commit.tree()?;
    Ok(vec![RevisionFrame {
        commit: to_commit(&commit),
        snapshot: to_snapshot(repo, &tree)?,
        changes: Vec::new(),
    }])
}

fn all_commits_blocking(repo: &git2::Repository) -> Result<Vec<RevisionFrame>, git2::Error> {
    let mut oids = commits_by_time(repo)?;
    oids.reverse();
    let mut commits = Vec::with_capacity(oids.len());
    for oid in oids {
        commits.push(repo.find_commit(oid)?);
    }
    replay(repo, commits)
}

fn all_merge_commits_blocking(
    repo: &git2::Repository,
) -> Result<Vec<RevisionFrame>, git2::Error> {
    let pr_heads = pull_request_heads(repo)?;
    let mut oids = commits_by_time(repo)?;
    oids.reverse();

    let mut selected = Vec::new();
    for oid in oids {
        let commit = repo.find_commit(oid)?;
        if commit.parent_count() <= 1 {
            continue;
        }
        if commit.parent_ids().skip(1).any(|id| pr_heads.contains(&id)) {
            selected.push(commit);
        }
    }
    replay(repo, selected)
}

fn pull_request_heads(repo: &git2::Repository) -> Result<HashSet<git2::Oid>, git2::Error> {
    let mut heads = HashSet::new();
    for reference in repo.references_glob("refs/heads/pull/*")? {
        if let Some(oid) = reference?.target() {
            heads.insert(oid);
        }
    }
    Ok(heads)
}

/// Replays `commits` (oldest first) into frames.
///
/// A commit seen before any baseline tree exists is skipped unless it has a
/// parent; the first replayed commit is diffed against its first parent's
/// tree, every later one against the previously replayed tree.
fn replay<'repo>(
    repo: &'repo git2::Repository,
    commits: Vec<git2::Commit<'repo>>,
) -> Result<Vec<RevisionFrame>, git2::Error> {
    let mut frames = Vec::new();
    let mut prev_tree: Option<git2::Tree<'repo>> = None;
    for commit in commits {
        let base = match prev_tree.take() {
            Some(tree) => tree,
            None => match commit.parent(0) {
                Ok(parent) => parent.tree()?,
                Err(_) => continue,
            },
        };
        let tree = commit.tree()?;
        let changes = diff_changes(repo, &base, &tree)?;
        frames.push(RevisionFrame {
            commit: to_commit(&commit),
            snapshot: to_snapshot(repo, &tree)?,
            changes,
        });
        prev_tree = Some(tree);
    }
    Ok(frames)
}

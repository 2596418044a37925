//! Conversions from libgit2 objects into the treport data model.

use chrono::{DateTime, TimeZone, Utc};

use crate::model::{ActionType, Change, Commit, File, Signature, Snapshot};

pub(crate) fn to_commit(src: &git2::Commit<'_>) -> Commit {
    Commit {
        hash: src.id().to_string(),
        author: to_signature(&src.author()),
        committer: to_signature(&src.committer()),
        pgp_signature: pgp_signature(src),
        message: src.message().unwrap_or_default().to_string(),
        tree_hash: src.tree_id().to_string(),
        parent_hashes: src.parent_ids().map(|id| id.to_string()).collect(),
    }
}

fn pgp_signature(src: &git2::Commit<'_>) -> String {
    src.header_field_bytes("gpgsig")
        .ok()
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default()
}

pub(crate) fn to_signature(src: &git2::Signature<'_>) -> Signature {
    Signature {
        name: src.name().unwrap_or_default().to_string(),
        email: src.email().unwrap_or_default().to_string(),
        when: to_timestamp(&src.when()),
    }
}

fn to_timestamp(time: &git2::Time) -> DateTime<Utc> {
    Utc.timestamp_opt(time.seconds(), 0)
        .single()
        .unwrap_or_default()
}

/// Lists every blob reachable from `tree` as a snapshot entry.
pub(crate) fn to_snapshot(
    repo: &git2::Repository,
    tree: &git2::Tree<'_>,
) -> Result<Snapshot, git2::Error> {
    let mut blobs = Vec::new();
    tree.walk(git2::TreeWalkMode::PreOrder, |root, entry| {
        if entry.kind() == Some(git2::ObjectType::Blob) {
            let name = format!("{}{}", root, entry.name().unwrap_or_default());
            blobs.push((name, entry.filemode() as u32, entry.id()));
        }
        git2::TreeWalkResult::Ok
    })?;

    let mut entries = Vec::with_capacity(blobs.len());
    for (name, mode, oid) in blobs {
        let blob = repo.find_blob(oid)?;
        entries.push(File {
            name,
            mode,
            size: blob.size() as i64,
            hash: oid.to_string(),
        });
    }
    Ok(Snapshot {
        hash: tree.id().to_string(),
        entries,
    })
}

/// Tree-vs-tree delta between two revisions.
pub(crate) fn diff_changes(
    repo: &git2::Repository,
    from: &git2::Tree<'_>,
    to: &git2::Tree<'_>,
) -> Result<Vec<Change>, git2::Error> {
    let diff = repo.diff_tree_to_tree(Some(from), Some(to), None)?;
    let mut changes = Vec::new();
    for delta in diff.deltas() {
        changes.push(Change {
            action: to_action(delta.status()),
            from: tree_file(repo, from, &delta.old_file())?,
            to: tree_file(repo, to, &delta.new_file())?,
        });
    }
    Ok(changes)
}

fn tree_file(
    repo: &git2::Repository,
    tree: &git2::Tree<'_>,
    file: &git2::DiffFile<'_>,
) -> Result<Option<File>, git2::Error> {
    if file.id().is_zero() {
        return Ok(None);
    }
    let Some(path) = file.path() else {
        return Ok(None);
    };
    let entry = tree.get_path(path)?;
    let blob = repo.find_blob(file.id())?;
    Ok(Some(File {
        name: path.to_string_lossy().into_owned(),
        mode: entry.filemode() as u32,
        size: blob.size() as i64,
        hash: file.id().to_string(),
    }))
}

fn to_action(status: git2::Delta) -> ActionType {
    match status {
        git2::Delta::Added => ActionType::Added,
        git2::Delta::Deleted => ActionType::Deleted,
        git2::Delta::Modified => ActionType::Updated,
        _ => ActionType::Updated,
    }
}

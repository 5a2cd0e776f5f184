//! Object-level writes: blob, tree, commit, compare-and-swap ref moves.
//!
//! These never look at the working tree, so they can target any branch
//! regardless of what is checked out.

use std::collections::BTreeMap;
use std::path::Path;

use git2::{Commit, ErrorCode, ObjectType, Oid, Repository, Signature, Tree};

use super::branch_ref;
use crate::error::{Error, Result};

const BLOB_MODE: i32 = 0o100644;
const TREE_MODE: i32 = 0o040000;

/// One file-level edit, with a path relative to the repository root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Upsert { path: String, content: Vec<u8> },
    Delete { path: String },
}

impl FileChange {
    pub fn upsert(path: impl Into<String>, content: Vec<u8>) -> Self {
        Self::Upsert {
            path: path.into(),
            content,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::Delete { path: path.into() }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::Upsert { path, .. } | Self::Delete { path } => path,
        }
    }
}

type Edit<'a> = (Vec<&'a str>, Option<Oid>);

/// Apply `changes` on top of `base` and return the new root tree id.
pub fn write_tree(repo: &Repository, base: Option<&Tree<'_>>, changes: &[FileChange]) -> Result<Oid> {
    let mut edits: Vec<Edit<'_>> = Vec::with_capacity(changes.len());
    for change in changes {
        let components: Vec<&str> = change
            .path()
            .split('/')
            .filter(|c| !c.is_empty())
            .collect();
        let blob = match change {
            FileChange::Upsert { content, .. } => Some(repo.blob(content)?),
            FileChange::Delete { .. } => None,
        };
        edits.push((components, blob));
    }

    match edit_tree(repo, base, &edits)? {
        Some(oid) => Ok(oid),
        None => Ok(repo.treebuilder(None)?.write()?),
    }
}

/// Returns `None` when the edited tree ends up empty.
fn edit_tree(repo: &Repository, base: Option<&Tree<'_>>, edits: &[Edit<'_>]) -> Result<Option<Oid>> {
    let mut builder = repo.treebuilder(base)?;
    let mut nested: BTreeMap<&str, Vec<Edit<'_>>> = BTreeMap::new();

    for (components, blob) in edits {
        match components.as_slice() {
            [] => {}
            [name] => match blob {
                Some(oid) => {
                    builder.insert(*name, *oid, BLOB_MODE)?;
                }
                None => {
                    if builder.get(*name)?.is_some() {
                        builder.remove(*name)?;
                    }
                }
            },
            [dir, rest @ ..] => nested
                .entry(*dir)
                .or_default()
                .push((rest.to_vec(), *blob)),
        }
    }

    for (dir, sub_edits) in nested {
        let existing = match builder.get(dir)? {
            Some(entry) if entry.kind() == Some(ObjectType::Tree) => {
                Some(repo.find_tree(entry.id())?)
            }
            _ => None,
        };
        match edit_tree(repo, existing.as_ref(), &sub_edits)? {
            Some(oid) => {
                builder.insert(dir, oid, TREE_MODE)?;
            }
            None => {
                if builder.get(dir)?.is_some() {
                    builder.remove(dir)?;
                }
            }
        }
    }

    if builder.is_empty() {
        return Ok(None);
    }
    Ok(Some(builder.write()?))
}

/// Create a commit object without moving any ref.
pub fn commit_changes(
    repo: &Repository,
    signature: &Signature<'_>,
    message: &str,
    tree: Oid,
    parents: &[&Commit<'_>],
) -> Result<Oid> {
    let tree = repo.find_tree(tree)?;
    Ok(repo.commit(None, signature, signature, message, &tree, parents)?)
}

fn conflict(branch: &str, e: git2::Error) -> Error {
    match e.code() {
        ErrorCode::Modified | ErrorCode::Exists | ErrorCode::Locked | ErrorCode::NotFound => {
            Error::WriteConflict {
                branch: branch.to_string(),
            }
        }
        _ => e.into(),
    }
}

/// Move `refs/heads/<branch>` to `new`, but only if it still points at
/// `expected`. `expected == None` means the branch must not exist yet.
pub fn move_ref(
    repo: &Repository,
    branch: &str,
    expected: Option<Oid>,
    new: Oid,
    message: &str,
) -> Result<()> {
    let refname = branch_ref(branch);
    let log = format!("fgraph: {}", message.lines().next().unwrap_or_default());
    match expected {
        Some(old) => {
            repo.reference_matching(&refname, new, true, old, &log)
                .map_err(|e| conflict(branch, e))?;
        }
        None => {
            repo.reference(&refname, new, false, &log)
                .map_err(|e| conflict(branch, e))?;
        }
    }
    tracing::debug!(branch, from = ?expected, to = %new, "moved ref");
    Ok(())
}

/// Undo a [`move_ref`]: put the branch back to `previous` (or delete it if
/// it did not exist), provided nobody moved it past `current` meanwhile.
pub fn restore_ref(repo: &Repository, branch: &str, current: Oid, previous: Option<Oid>) -> Result<()> {
    let refname = branch_ref(branch);
    match previous {
        Some(old) => {
            repo.reference_matching(&refname, old, true, current, "fgraph: rollback")
                .map_err(|e| conflict(branch, e))?;
        }
        None => {
            let mut reference = repo.find_reference(&refname)?;
            if reference.target() != Some(current) {
                return Err(Error::WriteConflict {
                    branch: branch.to_string(),
                });
            }
            reference.delete()?;
        }
    }
    tracing::warn!(branch, "rolled back ref");
    Ok(())
}

/// Read a file at `path` from a commit's tree; `None` when absent.
pub fn read_file(repo: &Repository, commit: &Commit<'_>, path: &str) -> Result<Option<Vec<u8>>> {
    let tree = commit.tree()?;
    let entry = match tree.get_path(Path::new(path)) {
        Ok(entry) => entry,
        Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if entry.kind() != Some(ObjectType::Blob) {
        return Ok(None);
    }
    let blob = repo.find_blob(entry.id())?;
    Ok(Some(blob.content().to_vec()))
}

//! Branch merges on the checked-out branch.

use std::fs;
use std::path::Path;

use git2::build::CheckoutBuilder;
use git2::{Commit, Oid, RepositoryState, ResetType};

use super::plumbing::{commit_changes, move_ref, write_tree, FileChange};
use super::GitRepo;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    UpToDate,
    FastForward,
    Normal,
}

/// Both sides of one conflicted path. `None` means the side deleted it.
#[derive(Debug, Clone)]
pub struct ConflictSides {
    pub path: String,
    pub ours: Option<Vec<u8>>,
    pub theirs: Option<Vec<u8>>,
}

impl GitRepo {
    pub fn merge_kind(&self, theirs: Oid) -> Result<MergeKind> {
        let annotated = self.raw().find_annotated_commit(theirs)?;
        let (analysis, _) = self.raw().merge_analysis(&[&annotated])?;
        Ok(if analysis.is_up_to_date() {
            MergeKind::UpToDate
        } else if analysis.is_fast_forward() {
            MergeKind::FastForward
        } else {
            MergeKind::Normal
        })
    }

    /// Merge `theirs` into HEAD, leaving the result staged. Conflicts stay in
    /// the index and as markers in the working tree.
    pub fn start_merge(&self, theirs: Oid) -> Result<()> {
        let annotated = self.raw().find_annotated_commit(theirs)?;
        self.raw().merge(&[&annotated], None, None)?;
        tracing::info!(theirs = %theirs, "merge started");
        Ok(())
    }

    pub fn merge_in_progress(&self) -> bool {
        self.raw().state() == RepositoryState::Merge
    }

    pub fn conflicts(&self) -> Result<Vec<ConflictSides>> {
        let index = self.raw().index()?;
        let mut out = Vec::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let Some(entry) = conflict
                .our
                .as_ref()
                .or(conflict.their.as_ref())
                .or(conflict.ancestor.as_ref())
            else {
                continue;
            };
            let path = String::from_utf8_lossy(&entry.path).into_owned();
            let ours = match &conflict.our {
                Some(e) => Some(self.raw().find_blob(e.id)?.content().to_vec()),
                None => None,
            };
            let theirs = match &conflict.their {
                Some(e) => Some(self.raw().find_blob(e.id)?.content().to_vec()),
                None => None,
            };
            out.push(ConflictSides { path, ours, theirs });
        }
        Ok(out)
    }

    pub fn conflicted_paths(&self) -> Result<Vec<String>> {
        Ok(self.conflicts()?.into_iter().map(|c| c.path).collect())
    }

    /// Settle one conflicted path with `content`, or by deleting it.
    pub fn resolve_conflict(&self, path: &str, content: Option<&[u8]>) -> Result<()> {
        let full = self.workdir()?.join(path);
        let mut index = self.raw().index()?;
        match content {
            Some(bytes) => {
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&full, bytes)?;
                index.add_path(Path::new(path))?;
            }
            None => {
                if full.exists() {
                    fs::remove_file(&full)?;
                }
                index.remove_path(Path::new(path))?;
            }
        }
        index.write()?;
        tracing::debug!(path, "resolved conflict");
        Ok(())
    }

    /// Commit the staged merge result plus `changes` with the given parents,
    /// move the current branch once and clear the merge state.
    pub fn finish_merge(&self, message: &str, parents: &[Oid], changes: &[FileChange]) -> Result<Oid> {
        let branch = self
            .current_branch()?
            .ok_or_else(|| Error::InvalidTransition("HEAD is detached".to_string()))?;
        let head = self.head_commit()?.id();
        let mut index = self.raw().index()?;
        if index.has_conflicts() {
            return Err(Error::MergeConflict {
                paths: self.conflicted_paths()?,
            });
        }
        let merged = self.raw().find_tree(index.write_tree()?)?;
        let tree = write_tree(self.raw(), Some(&merged), changes)?;
        let parents = parents
            .iter()
            .map(|oid| self.raw().find_commit(*oid))
            .collect::<Result<Vec<Commit<'_>>, _>>()?;
        let parent_refs: Vec<&Commit<'_>> = parents.iter().collect();
        let oid = commit_changes(self.raw(), &self.signature()?, message, tree, &parent_refs)?;
        move_ref(self.raw(), &branch, Some(head), oid, message)?;
        self.sync_worktree(changes)?;
        self.raw().cleanup_state()?;
        tracing::info!(branch = %branch, commit = %oid, "merge committed");
        Ok(oid)
    }

    /// Move the checked-out `branch` from `from` to `to`, updating the
    /// working tree first. The tree is restored if the ref moved meanwhile.
    pub fn fast_forward(&self, branch: &str, from: Oid, to: Oid) -> Result<()> {
        let target = self.raw().find_object(to, None)?;
        self.raw()
            .checkout_tree(&target, Some(CheckoutBuilder::new().safe()))?;
        if let Err(e) = move_ref(self.raw(), branch, Some(from), to, "fast-forward") {
            let previous = self.raw().find_object(from, None)?;
            self.raw()
                .checkout_tree(&previous, Some(CheckoutBuilder::new().force()))?;
            return Err(e);
        }
        tracing::info!(branch, to = %to, "fast-forwarded");
        Ok(())
    }

    /// Throw away a merge in progress: hard reset to `reset_to` and clear
    /// MERGE_HEAD and friends.
    pub fn abort_merge(&self, reset_to: Oid) -> Result<()> {
        let target = self.raw().find_object(reset_to, None)?;
        self.raw().reset(&target, ResetType::Hard, None)?;
        self.raw().cleanup_state()?;
        tracing::info!(to = %reset_to, "merge aborted");
        Ok(())
    }
}

//! Repository access.
//!
//! Everything above this module talks to git through [`GitRepo`] and the
//! scanner/plumbing helpers; nothing else touches `git2` working-tree
//! operations directly.

mod merge;
mod plumbing;
mod scanner;

use std::fs;
use std::path::{Path, PathBuf};

use git2::build::CheckoutBuilder;
use git2::{BranchType, Commit, ErrorCode, Oid, Repository, Signature, Status, StatusOptions};

pub use merge::{ConflictSides, MergeKind};
pub use plumbing::{commit_changes, move_ref, read_file, restore_ref, write_tree, FileChange};
pub use scanner::{RawFile, RefKind, RefScanner, ScannedRef};

use crate::error::{Error, Result};

const FALLBACK_NAME: &str = "fgraph";
const FALLBACK_EMAIL: &str = "fgraph@localhost";

pub fn branch_ref(name: &str) -> String {
    format!("refs/heads/{}", name)
}

/// Thin wrapper around a non-bare repository.
pub struct GitRepo {
    repo: Repository,
}

impl GitRepo {
    /// Open the repository containing `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::discover(path)?;
        Self::from_repository(repo)
    }

    pub fn from_repository(repo: Repository) -> Result<Self> {
        if repo.is_bare() {
            return Err(Error::BareRepository);
        }
        Ok(Self { repo })
    }

    pub fn raw(&self) -> &Repository {
        &self.repo
    }

    pub fn workdir(&self) -> Result<&Path> {
        self.repo.workdir().ok_or(Error::BareRepository)
    }

    /// Private directory inside `.git` for workflow state.
    pub fn state_dir(&self) -> PathBuf {
        self.repo.path().join("fgraph")
    }

    pub fn signature(&self) -> Result<Signature<'static>> {
        match self.repo.signature() {
            Ok(sig) => Ok(sig),
            Err(e) if e.code() == ErrorCode::NotFound => {
                Ok(Signature::now(FALLBACK_NAME, FALLBACK_EMAIL)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Short name of the checked-out branch, `None` when HEAD is detached.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let head = self.repo.head()?;
        if !head.is_branch() {
            return Ok(None);
        }
        Ok(head.shorthand().map(str::to_string))
    }

    pub fn head_commit(&self) -> Result<Commit<'_>> {
        Ok(self.repo.head()?.peel_to_commit()?)
    }

    pub fn branch_tip(&self, name: &str) -> Result<Option<Oid>> {
        match self.repo.find_branch(name, BranchType::Local) {
            Ok(branch) => Ok(branch.get().target()),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn remote_tip(&self, name: &str) -> Result<Option<Oid>> {
        match self.repo.find_branch(name, BranchType::Remote) {
            Ok(branch) => Ok(branch.get().target()),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// First remote-tracking branch whose name maps onto local `name`
    /// (`origin/<name>`, `upstream/<name>`, ...).
    pub fn find_remote_branch(&self, name: &str) -> Result<Option<String>> {
        let mut found = Vec::new();
        for branch in self.repo.branches(Some(BranchType::Remote))? {
            let (branch, _) = branch?;
            if let Some(remote) = branch.name()? {
                if remote.split_once('/').map(|(_, rest)| rest) == Some(name) {
                    found.push(remote.to_string());
                }
            }
        }
        found.sort();
        Ok(found.into_iter().next())
    }

    pub fn create_branch(&self, name: &str, at: Oid) -> Result<()> {
        let commit = self.repo.find_commit(at)?;
        self.repo.branch(name, &commit, false).map_err(|e| {
            if e.code() == ErrorCode::Exists {
                Error::WriteConflict {
                    branch: name.to_string(),
                }
            } else {
                e.into()
            }
        })?;
        tracing::info!(branch = name, commit = %at, "created branch");
        Ok(())
    }

    /// Create a local branch tracking `remote` (e.g. `origin/x`).
    pub fn create_tracking_branch(&self, name: &str, remote: &str) -> Result<()> {
        let tip = self
            .remote_tip(remote)?
            .ok_or_else(|| Error::BranchNotFound(remote.to_string()))?;
        self.create_branch(name, tip)?;
        let mut branch = self.repo.find_branch(name, BranchType::Local)?;
        branch.set_upstream(Some(remote))?;
        Ok(())
    }

    pub fn delete_branch(&self, name: &str) -> Result<()> {
        let mut branch = self.repo.find_branch(name, BranchType::Local)?;
        branch.delete()?;
        tracing::info!(branch = name, "deleted branch");
        Ok(())
    }

    /// Check out a local branch. Uses a safe checkout, so local edits that
    /// the switch would overwrite make it fail instead of being lost.
    pub fn checkout_branch(&self, name: &str) -> Result<()> {
        let refname = branch_ref(name);
        let target = self
            .repo
            .revparse_single(&refname)
            .map_err(|_| Error::BranchNotFound(name.to_string()))?;
        self.repo
            .checkout_tree(&target, Some(CheckoutBuilder::new().safe()))
            .map_err(|e| {
                if e.code() == ErrorCode::Conflict {
                    Error::DirtyWorkingTree {
                        paths: vec![e.message().to_string()],
                    }
                } else {
                    e.into()
                }
            })?;
        self.repo.set_head(&refname)?;
        tracing::info!(branch = name, "checked out branch");
        Ok(())
    }

    /// Tracked files with staged or unstaged modifications.
    pub fn dirty_paths(&self) -> Result<Vec<String>> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(false).include_ignored(false);
        let statuses = self.repo.statuses(Some(&mut opts))?;
        Ok(statuses
            .iter()
            .filter(|entry| !entry.status().is_empty() && entry.status() != Status::IGNORED)
            .filter_map(|entry| entry.path().map(str::to_string))
            .collect())
    }

    pub fn ensure_clean(&self) -> Result<()> {
        let paths = self.dirty_paths()?;
        if paths.is_empty() {
            Ok(())
        } else {
            Err(Error::DirtyWorkingTree { paths })
        }
    }

    /// Stage every modification to tracked files, like `git add -u`.
    pub fn stage_tracked(&self) -> Result<()> {
        let mut index = self.repo.index()?;
        index.update_all(["*"], None)?;
        index.write()?;
        Ok(())
    }

    /// Whether the index differs from HEAD.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let head = self.head_commit()?.tree_id();
        let mut index = self.repo.index()?;
        Ok(index.write_tree()? != head)
    }

    /// Write `changes` into the working tree and index of the checked-out
    /// branch, after its ref already moved to a commit containing them.
    pub fn sync_worktree(&self, changes: &[FileChange]) -> Result<()> {
        let root = self.workdir()?.to_path_buf();
        let mut index = self.repo.index()?;
        for change in changes {
            let path = Path::new(change.path());
            let full = root.join(path);
            match change {
                FileChange::Upsert { content, .. } => {
                    if let Some(parent) = full.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&full, content)?;
                    index.add_path(path)?;
                }
                FileChange::Delete { .. } => {
                    if full.exists() {
                        fs::remove_file(&full)?;
                    }
                    if index.get_path(path, 0).is_some() {
                        index.remove_path(path)?;
                    }
                }
            }
        }
        index.write()?;
        Ok(())
    }

    /// Commit the staged index plus `changes` onto HEAD with one ref move.
    pub fn commit_staged(&self, message: &str, changes: &[FileChange]) -> Result<Oid> {
        let branch = self
            .current_branch()?
            .ok_or_else(|| Error::InvalidTransition("HEAD is detached".to_string()))?;
        let head = self.head_commit()?;
        let mut index = self.repo.index()?;
        let staged = self.repo.find_tree(index.write_tree()?)?;
        let tree = write_tree(&self.repo, Some(&staged), changes)?;
        let oid = commit_changes(&self.repo, &self.signature()?, message, tree, &[&head])?;
        move_ref(&self.repo, &branch, Some(head.id()), oid, message)?;
        self.sync_worktree(changes)?;
        tracing::info!(branch = %branch, commit = %oid, "committed");
        Ok(oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() -> (tempfile::TempDir, GitRepo) {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = git2::RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(dir.path(), &opts).unwrap();
        {
            let sig = Signature::now("Test", "test@example.com").unwrap();
            fs::write(dir.path().join("README.md"), "hello\n").unwrap();
            let mut index = repo.index().unwrap();
            index.add_path(Path::new("README.md")).unwrap();
            index.write().unwrap();
            let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
                .unwrap();
        }
        (dir, GitRepo::from_repository(repo).unwrap())
    }

    #[test]
    fn reports_current_branch_and_tips() {
        let (_dir, repo) = init();
        assert_eq!(repo.current_branch().unwrap().as_deref(), Some("main"));
        assert!(repo.branch_tip("main").unwrap().is_some());
        assert!(repo.branch_tip("nope").unwrap().is_none());
    }

    #[test]
    fn dirty_tree_is_detected() {
        let (dir, repo) = init();
        assert!(repo.ensure_clean().is_ok());
        fs::write(dir.path().join("README.md"), "changed\n").unwrap();
        match repo.ensure_clean() {
            Err(Error::DirtyWorkingTree { paths }) => assert_eq!(paths, vec!["README.md"]),
            other => panic!("expected dirty tree, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn commit_staged_includes_extra_changes() {
        let (dir, repo) = init();
        fs::write(dir.path().join("README.md"), "changed\n").unwrap();
        repo.stage_tracked().unwrap();
        let oid = repo
            .commit_staged(
                "work",
                &[FileChange::upsert(".features/a.yaml", b"id: 1\n".to_vec())],
            )
            .unwrap();

        let commit = repo.raw().find_commit(oid).unwrap();
        let extra = read_file(repo.raw(), &commit, ".features/a.yaml").unwrap();
        assert_eq!(extra.as_deref(), Some(&b"id: 1\n"[..]));
        assert!(repo.ensure_clean().is_ok());
        assert!(dir.path().join(".features/a.yaml").exists());
    }
}

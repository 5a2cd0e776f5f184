//! Ref scanner: reads the metadata directory of every branch straight out
//! of the object database.
//!
//! Nothing here checks out a tree, touches the index or moves a ref, so a
//! scan is safe while other operations are in progress. It never fetches;
//! remote-tracking refs are read as they were left by the last fetch.

use std::path::Path;

use git2::{BranchType, ErrorCode, ObjectType, Oid, Repository, Tree};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RefKind {
    Local,
    Remote,
}

/// One blob found under the metadata directory.
#[derive(Debug, Clone)]
pub struct RawFile {
    /// Path relative to the repository root.
    pub path: String,
    pub content: Vec<u8>,
}

/// Everything found under the metadata directory of one ref.
#[derive(Debug, Clone)]
pub struct ScannedRef {
    /// Short name: `main` for local branches, `origin/main` for remote ones.
    pub name: String,
    pub kind: RefKind,
    pub tip: Oid,
    pub files: Vec<RawFile>,
}

pub struct RefScanner<'r> {
    repo: &'r Repository,
    metadata_dir: &'r str,
}

impl<'r> RefScanner<'r> {
    pub fn new(repo: &'r Repository, metadata_dir: &'r str) -> Self {
        Self { repo, metadata_dir }
    }

    /// Local branches first, then remote-tracking branches, each sorted by
    /// name. Symbolic refs such as `origin/HEAD` are skipped.
    pub fn refs(&self) -> Result<Vec<(String, RefKind, Oid)>> {
        let mut refs = Vec::new();
        for (branch_type, kind) in [(BranchType::Local, RefKind::Local), (BranchType::Remote, RefKind::Remote)] {
            let mut found = Vec::new();
            for branch in self.repo.branches(Some(branch_type))? {
                let (branch, _) = branch?;
                let Some(tip) = branch.get().target() else {
                    continue;
                };
                let Some(name) = branch.name()? else {
                    continue;
                };
                found.push((name.to_string(), kind, tip));
            }
            found.sort_by(|a, b| a.0.cmp(&b.0));
            refs.extend(found);
        }
        Ok(refs)
    }

    /// Scan every ref.
    pub fn scan(&self) -> Result<Vec<ScannedRef>> {
        let refs = self.refs()?;
        let mut scanned = Vec::with_capacity(refs.len());
        for (name, kind, tip) in refs {
            let files = self.scan_commit(tip)?;
            tracing::debug!(refname = %name, files = files.len(), "scanned ref");
            scanned.push(ScannedRef {
                name,
                kind,
                tip,
                files,
            });
        }
        Ok(scanned)
    }

    /// Blobs under the metadata directory of `commit`. A commit without the
    /// directory yields nothing.
    pub fn scan_commit(&self, commit: Oid) -> Result<Vec<RawFile>> {
        let tree = self.repo.find_commit(commit)?.tree()?;
        self.scan_tree(&tree)
    }

    /// Like [`scan_commit`](Self::scan_commit), for a tree that may not be
    /// committed yet (a staged merge result, for instance).
    pub fn scan_tree(&self, tree: &Tree<'_>) -> Result<Vec<RawFile>> {
        let entry = match tree.get_path(Path::new(self.metadata_dir)) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if entry.kind() != Some(ObjectType::Tree) {
            return Ok(Vec::new());
        }
        let dir = self.repo.find_tree(entry.id())?;
        let mut files = Vec::new();
        self.collect(&dir, self.metadata_dir, &mut files)?;
        Ok(files)
    }

    fn collect(&self, tree: &Tree<'_>, prefix: &str, files: &mut Vec<RawFile>) -> Result<()> {
        for entry in tree.iter() {
            let Some(name) = entry.name() else {
                continue;
            };
            let path = format!("{}/{}", prefix, name);
            match entry.kind() {
                Some(ObjectType::Tree) => {
                    let subtree = self.repo.find_tree(entry.id())?;
                    self.collect(&subtree, &path, files)?;
                }
                Some(ObjectType::Blob) => {
                    let blob = self.repo.find_blob(entry.id())?;
                    files.push(RawFile {
                        path,
                        content: blob.content().to_vec(),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

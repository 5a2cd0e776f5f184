//! Feature store: parses the records the ref scanner finds, deduplicates
//! them across refs and writes them back to their owning branches.
//!
//! Reads never touch the working tree. Writes build a commit directly on the
//! target branch and move its ref with a compare-and-swap against the tip
//! seen at load time; the checked-out branch's working tree and index are
//! brought along afterwards.

mod index;
mod record;
mod set;

use std::collections::{BTreeMap, HashMap};

use git2::{Oid, Tree};
use rayon::prelude::*;
use uuid::Uuid;

pub use index::{index_path, IdIndex, INDEX_FILE};
pub use record::{is_record_path, parse_record, record_path, serialize_record};
pub use set::{local_name, Divergence, FeatureSet, MalformedRecord, StoredFeature};

use self::set::{Context, FoundRecord};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::git::{commit_changes, move_ref, read_file, restore_ref, write_tree, FileChange, GitRepo, RefKind, RefScanner, ScannedRef};
use crate::models::Feature;

/// Which refs a lookup may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Only the commit HEAD points at.
    CurrentBranch,
    /// Every local and remote-tracking branch.
    CrossBranch,
}

/// A record to write and the branch it belongs to.
#[derive(Debug, Clone)]
pub struct RecordWrite {
    pub feature: Feature,
    pub branch: String,
}

impl RecordWrite {
    pub fn new(feature: Feature, branch: impl Into<String>) -> Self {
        Self {
            feature,
            branch: branch.into(),
        }
    }
}

pub struct FeatureStore<'a> {
    git: &'a GitRepo,
    config: &'a Config,
}

impl<'a> FeatureStore<'a> {
    pub fn new(git: &'a GitRepo, config: &'a Config) -> Self {
        Self { git, config }
    }

    pub fn git(&self) -> &'a GitRepo {
        self.git
    }

    pub fn config(&self) -> &'a Config {
        self.config
    }

    fn scanner(&self) -> RefScanner<'_> {
        RefScanner::new(self.git.raw(), self.config.metadata_dir())
    }

    pub fn load(&self, scope: Scope) -> Result<FeatureSet> {
        match scope {
            Scope::CurrentBranch => self.load_current_branch(),
            Scope::CrossBranch => self.load_all_branches(),
        }
    }

    /// Records committed on HEAD. Uncommitted edits are not seen.
    pub fn load_current_branch(&self) -> Result<FeatureSet> {
        let head = self.git.head_commit()?.id();
        let branch = self.git.current_branch()?;
        let scanned = ScannedRef {
            name: branch.clone().unwrap_or_else(|| "HEAD".to_string()),
            kind: RefKind::Local,
            tip: head,
            files: self.scanner().scan_commit(head)?,
        };
        let tips = branch.iter().map(|b| (b.clone(), head)).collect();
        Ok(self.assemble(&[scanned], branch, tips, HashMap::new()))
    }

    /// Records on every local and remote-tracking branch, deduplicated by id.
    pub fn load_all_branches(&self) -> Result<FeatureSet> {
        let scanned = self.scanner().scan()?;
        let mut tips = HashMap::new();
        let mut remote_tips = HashMap::new();
        for r in &scanned {
            match r.kind {
                RefKind::Local => tips.insert(r.name.clone(), r.tip),
                RefKind::Remote => remote_tips.insert(r.name.clone(), r.tip),
            };
        }
        let current = self.git.current_branch()?;
        let set = self.assemble(&scanned, current, tips, remote_tips);
        tracing::debug!(refs = scanned.len(), features = set.len(), "loaded all branches");
        Ok(set)
    }

    fn assemble(
        &self,
        scanned: &[ScannedRef],
        current_branch: Option<String>,
        tips: HashMap<String, Oid>,
        remote_tips: HashMap<String, Oid>,
    ) -> FeatureSet {
        let index_file = index_path(self.config.metadata_dir());
        let parsed: Vec<std::result::Result<FoundRecord, MalformedRecord>> = scanned
            .par_iter()
            .flat_map_iter(|r| {
                let index_file = index_file.as_str();
                r.files
                    .iter()
                    .filter(move |f| f.path != index_file && is_record_path(&f.path))
                    .map(move |f| match parse_record(&f.path, &f.content) {
                        Ok(feature) => Ok(FoundRecord {
                            refname: r.name.clone(),
                            kind: r.kind,
                            path: f.path.clone(),
                            feature,
                        }),
                        Err(e) => Err(MalformedRecord {
                            refname: r.name.clone(),
                            path: f.path.clone(),
                            reason: match e {
                                Error::Malformed { reason, .. } => reason,
                                other => other.to_string(),
                            },
                        }),
                    })
            })
            .collect();

        let mut found = Vec::new();
        let mut malformed = Vec::new();
        for result in parsed {
            match result {
                Ok(record) => found.push(record),
                Err(bad) => {
                    tracing::warn!(refname = %bad.refname, path = %bad.path, "skipping malformed record: {}", bad.reason);
                    malformed.push(bad);
                }
            }
        }

        FeatureSet::assemble(
            found,
            malformed,
            Context {
                current_branch,
                base_branch: &self.config.base_branch,
                tips,
                remote_tips,
            },
        )
    }

    /// Look a feature up on HEAD by id, consulting the index file first.
    pub fn get_current(&self, id: Uuid) -> Result<Option<Feature>> {
        let head = self.git.head_commit()?;
        let repo = self.git.raw();
        let hinted = match read_file(repo, &head, &index_path(self.config.metadata_dir()))? {
            Some(bytes) => IdIndex::parse(&bytes)
                .ok()
                .and_then(|index| index.get(&id).map(str::to_string)),
            None => None,
        };
        if let Some(path) = hinted {
            if let Some(bytes) = read_file(repo, &head, &path)? {
                match parse_record(&path, &bytes) {
                    Ok(feature) if feature.id == id => return Ok(Some(feature)),
                    _ => {}
                }
            }
        }
        tracing::debug!(%id, "index miss, scanning current branch");
        Ok(self.load_current_branch()?.feature(&id).cloned())
    }

    pub fn find_by_name_or_id(&self, query: &str, scope: Scope) -> Result<StoredFeature> {
        if scope == Scope::CurrentBranch {
            if let Ok(id) = Uuid::parse_str(query.trim()) {
                let feature = self
                    .get_current(id)?
                    .ok_or_else(|| Error::NotFound(query.to_string()))?;
                let branch = self.git.current_branch()?.unwrap_or_else(|| "HEAD".to_string());
                return Ok(StoredFeature {
                    path: record_path(self.config.metadata_dir(), &feature),
                    feature,
                    branch: branch.clone(),
                    source_ref: branch.clone(),
                    remote_only: false,
                    refs: vec![branch],
                });
            }
        }
        Ok(self.load(scope)?.find(query)?.clone())
    }

    /// File changes that put `features` into `tree` and refresh the index
    /// file. A record whose path changed (rename) is moved.
    pub fn tree_changes(&self, tree: &Tree<'_>, features: &[&Feature]) -> Result<Vec<FileChange>> {
        let dir = self.config.metadata_dir();
        let index_file = index_path(dir);
        let mut index = IdIndex::default();
        for file in self.scanner().scan_tree(tree)? {
            if file.path == index_file || !is_record_path(&file.path) {
                continue;
            }
            match parse_record(&file.path, &file.content) {
                Ok(feature) => index.insert(feature.id, file.path),
                Err(e) => tracing::warn!(path = %file.path, "not indexing record: {}", e),
            }
        }

        let mut changes = Vec::with_capacity(features.len() + 1);
        for feature in features {
            let path = record_path(dir, feature);
            if let Some(old) = index.get(&feature.id) {
                if old != path {
                    changes.push(FileChange::delete(old));
                }
            }
            changes.push(FileChange::upsert(path.clone(), serialize_record(feature)?));
            index.insert(feature.id, path);
        }
        changes.push(FileChange::upsert(index_file, index.to_bytes()?));
        Ok(changes)
    }

    /// Commit `features` on top of `base` and move `branch` from `expected`.
    fn write_branch(
        &self,
        branch: &str,
        expected: Option<Oid>,
        base: Oid,
        features: &[&Feature],
        message: &str,
    ) -> Result<(Oid, Vec<FileChange>)> {
        let repo = self.git.raw();
        let parent = repo.find_commit(base)?;
        let parent_tree = parent.tree()?;
        let changes = self.tree_changes(&parent_tree, features)?;
        let tree = write_tree(repo, Some(&parent_tree), &changes)?;
        let oid = commit_changes(repo, &self.git.signature()?, message, tree, &[&parent])?;
        move_ref(repo, branch, expected, oid, message)?;
        Ok((oid, changes))
    }

    pub fn save(&self, set: &FeatureSet, feature: &Feature, branch: &str, message: &str) -> Result<Oid> {
        let written = self.save_all(set, &[RecordWrite::new(feature.clone(), branch)], message)?;
        written
            .into_iter()
            .next()
            .map(|(_, oid)| oid)
            .ok_or_else(|| Error::NotFound(feature.id.to_string()))
    }

    /// Write every record to its branch, one commit per branch. Either every
    /// ref moves, or the ones already moved are put back and the error is
    /// returned.
    pub fn save_all(&self, set: &FeatureSet, writes: &[RecordWrite], message: &str) -> Result<Vec<(String, Oid)>> {
        let mut by_branch: BTreeMap<&str, Vec<&Feature>> = BTreeMap::new();
        for write in writes {
            by_branch
                .entry(write.branch.as_str())
                .or_default()
                .push(&write.feature);
        }

        let mut plan = Vec::with_capacity(by_branch.len());
        for (branch, features) in by_branch {
            let tip = match set.tip(branch) {
                Some(tip) => Some(tip),
                None => self.git.branch_tip(branch)?,
            };
            let (expected, base) = match (tip, set.remote_base(branch)) {
                (Some(tip), _) => (Some(tip), tip),
                (None, Some(remote)) => (None, remote),
                (None, None) => return Err(Error::BranchNotFound(branch.to_string())),
            };
            plan.push((branch, expected, base, features));
        }

        let current = self.git.current_branch()?;
        let mut moved: Vec<(String, Oid, Option<Oid>, Vec<FileChange>)> = Vec::new();
        for (branch, expected, base, features) in plan {
            match self.write_branch(branch, expected, base, &features, message) {
                Ok((oid, changes)) => {
                    tracing::info!(branch, commit = %oid, records = features.len(), "saved records");
                    moved.push((branch.to_string(), oid, expected, changes));
                }
                Err(e) => {
                    self.rollback(&moved);
                    return Err(e);
                }
            }
        }

        for (branch, _, _, changes) in &moved {
            if current.as_deref() == Some(branch.as_str()) {
                self.git.sync_worktree(changes)?;
            }
        }
        Ok(moved
            .into_iter()
            .map(|(branch, oid, _, _)| (branch, oid))
            .collect())
    }

    fn rollback(&self, moved: &[(String, Oid, Option<Oid>, Vec<FileChange>)]) {
        for (branch, oid, previous, _) in moved.iter().rev() {
            if let Err(e) = restore_ref(self.git.raw(), branch, *oid, *previous) {
                tracing::error!(branch = %branch, "rollback failed: {}", e);
            }
        }
    }

    /// Create `branch` at a new commit on top of `from` carrying `feature`.
    /// Fails with a write conflict if the branch already exists.
    pub fn save_on_new_branch(&self, feature: &Feature, branch: &str, from: Oid, message: &str) -> Result<Oid> {
        let (oid, _) = self.write_branch(branch, None, from, &[feature], message)?;
        tracing::info!(branch, commit = %oid, "created branch with record");
        Ok(oid)
    }
}

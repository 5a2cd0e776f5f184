//! Feature lifecycle on top of branches.
//!
//! Version states are derived from timestamps (see [`VersionState`]):
//!
//! - `create` writes an open version, on a new branch or on the current one
//! - `commit` records work, moving the version to in progress
//! - `merge` closes the version by merging its branch into the base branch
//! - `merge --continue` / `merge --abort` settle a conflicted merge
//! - `reopen` starts the next version of a closed feature
//!
//! Every command performs at most one ref write that the user asked for
//! (branch deletion after a merge is cleanup, not part of the write).

mod prompt;
mod state;

use chrono::Utc;
use git2::Oid;
use serde::Serialize;
use uuid::Uuid;

pub use prompt::{Choice, FuzzySimilarity, NameMatch, NonInteractive, Prompter, Similarity};
pub use state::MergeState;

use crate::config::{Config, CreationMode};
use crate::error::{Error, Result};
use crate::git::{commit_changes, restore_ref, write_tree, GitRepo, MergeKind};
use crate::graph::{Catalog, RelationshipGraph};
use crate::models::{slugify, CreateFeatureInput, Feature, UpdateFeatureInput, VersionState};
use crate::store::{index_path, parse_record, FeatureSet, FeatureStore, Scope, StoredFeature};

#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOptions {
    /// Record the feature on the base branch instead of a branch of its own.
    pub shared: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateOutcome {
    pub feature: Feature,
    pub branch: String,
    /// `false` when the prompter chose to reuse an existing feature.
    pub created: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    /// Stage modifications to tracked files first.
    pub all: bool,
    /// Attribute the commit to this feature instead of the one owning the
    /// current branch.
    pub feature: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitOutcome {
    #[serde(serialize_with = "serialize_oid")]
    pub commit: Oid,
    pub feature: Option<Feature>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOptions {
    pub squash: bool,
    pub keep_branch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    FastForward,
    Merge,
    Squash,
    /// The branch was already contained in the base branch.
    AlreadyMerged,
    /// The version had no branch; it was closed where it lives.
    CloseOnly,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub feature: Feature,
    pub mode: MergeMode,
    #[serde(serialize_with = "serialize_oid")]
    pub commit: Oid,
    pub branch_deleted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub state: Option<VersionState>,
    pub tag: Option<String>,
    pub category: Option<String>,
    pub branch: Option<String>,
}

impl ListFilter {
    fn matches(&self, stored: &StoredFeature) -> bool {
        let feature = &stored.feature;
        self.state.map_or(true, |s| feature.state() == s)
            && self.tag.as_ref().map_or(true, |t| feature.tags.contains(t))
            && self
                .category
                .as_ref()
                .map_or(true, |c| feature.category.as_deref() == Some(c.as_str()))
            && self
                .branch
                .as_ref()
                .map_or(true, |b| &stored.branch == b || feature.active_branch() == Some(b.as_str()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusFeature {
    pub id: Uuid,
    pub name: String,
    pub version: u32,
    pub state: VersionState,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub branch: Option<String>,
    pub feature: Option<StatusFeature>,
    pub merge_in_progress: bool,
    /// Feature of the pending workflow merge, if any.
    pub pending_merge: Option<String>,
}

fn serialize_oid<S: serde::Serializer>(oid: &Oid, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&oid.to_string())
}

pub struct Workflow<'a> {
    git: &'a GitRepo,
    config: &'a Config,
    catalog: &'a Catalog,
    store: FeatureStore<'a>,
    prompter: &'a dyn Prompter,
    similarity: &'a dyn Similarity,
}

impl<'a> Workflow<'a> {
    pub fn new(
        git: &'a GitRepo,
        config: &'a Config,
        catalog: &'a Catalog,
        prompter: &'a dyn Prompter,
        similarity: &'a dyn Similarity,
    ) -> Self {
        Self {
            git,
            config,
            catalog,
            store: FeatureStore::new(git, config),
            prompter,
            similarity,
        }
    }

    pub fn store(&self) -> &FeatureStore<'a> {
        &self.store
    }

    pub fn graph(&self) -> RelationshipGraph<'_> {
        RelationshipGraph::new(&self.store, self.catalog)
    }

    fn version_branch(&self, name: &str, version: u32) -> String {
        let slug = slugify(name);
        if version <= 1 {
            format!("{}{}", self.config.branch_prefix, slug)
        } else {
            format!("{}{}-v{}", self.config.branch_prefix, slug, version)
        }
    }

    fn ensure_no_merge(&self) -> Result<()> {
        if self.git.merge_in_progress() || MergeState::load(&self.git.state_dir())?.is_some() {
            return Err(Error::MergeInProgress);
        }
        Ok(())
    }

    fn current_branch(&self) -> Result<String> {
        self.git
            .current_branch()?
            .ok_or_else(|| Error::InvalidTransition("HEAD is detached".to_string()))
    }

    /// Create `branch` from `from` with `feature` recorded on it and check
    /// it out. The branch is removed again if the checkout fails.
    fn branch_and_checkout(&self, feature: &Feature, branch: &str, from: Oid, message: &str) -> Result<()> {
        let oid = self.store.save_on_new_branch(feature, branch, from, message)?;
        if let Err(e) = self.git.checkout_branch(branch) {
            if let Err(undo) = restore_ref(self.git.raw(), branch, oid, None) {
                tracing::error!(branch, "could not remove branch after failed checkout: {}", undo);
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn create(&self, input: CreateFeatureInput, options: CreateOptions) -> Result<CreateOutcome> {
        if input.name.trim().is_empty() {
            return Err(Error::InvalidInput("feature name must not be empty".to_string()));
        }
        self.ensure_no_merge()?;
        let set = self.store.load_all_branches()?;

        let candidates: Vec<(Uuid, &str)> = set.features().map(|f| (f.id, f.name.as_str())).collect();
        let matches = self.similarity.rank(&input.name, &candidates);
        if !matches.is_empty() {
            match self.prompter.duplicate_name(&input.name, &matches)? {
                Choice::Reuse(id) => {
                    let stored = set.get(&id).ok_or_else(|| Error::NotFound(id.to_string()))?;
                    tracing::info!(feature = %stored.feature.name, "reusing existing feature");
                    return Ok(CreateOutcome {
                        feature: stored.feature.clone(),
                        branch: stored.branch.clone(),
                        created: false,
                    });
                }
                Choice::Cancel => return Err(Error::Cancelled),
                Choice::CreateNew => {}
            }
        }

        let now = Utc::now();
        let message = format!("Create feature '{}'", input.name.trim());

        if options.shared {
            if !self.config.allow_shared_branch {
                return Err(Error::SharedBranchDisallowed);
            }
            let feature = Feature::new(input, None, now);
            let branch = self.config.base_branch.clone();
            self.store.save(&set, &feature, &branch, &message)?;
            tracing::info!(feature = %feature.name, branch = %branch, "created shared feature");
            return Ok(CreateOutcome {
                feature,
                branch,
                created: true,
            });
        }

        let (feature, branch) = match self.config.creation_mode {
            CreationMode::TrunkBased => {
                let branch = self.current_branch()?;
                let feature = Feature::new(input, None, now);
                self.store.save(&set, &feature, &branch, &message)?;
                (feature, branch)
            }
            CreationMode::BranchPerFeature => {
                let branch = self.version_branch(&input.name, 1);
                let feature = Feature::new(input, Some(branch.clone()), now);
                let head = self.git.head_commit()?.id();
                self.branch_and_checkout(&feature, &branch, head, &message)?;
                (feature, branch)
            }
        };
        tracing::info!(feature = %feature.name, branch = %branch, "created feature");
        Ok(CreateOutcome {
            feature,
            branch,
            created: true,
        })
    }

    /// Check out the branch of the feature's active version. Refuses to run
    /// over uncommitted changes.
    pub fn switch(&self, query: &str) -> Result<String> {
        self.ensure_no_merge()?;
        self.git.ensure_clean()?;
        let set = self.store.load_all_branches()?;
        let stored = set.find(query)?;

        let mut candidates: Vec<&str> = Vec::new();
        if let Some(active) = stored.feature.active_branch() {
            candidates.push(active);
        }
        candidates.push(&stored.branch);

        let mut target = None;
        for branch in candidates {
            if self.git.branch_tip(branch)?.is_some() {
                target = Some(branch.to_string());
                break;
            }
            if let Some(remote) = self.git.find_remote_branch(branch)? {
                self.git.create_tracking_branch(branch, &remote)?;
                target = Some(branch.to_string());
                break;
            }
        }
        let branch = target.ok_or_else(|| Error::BranchNotFound(stored.branch.clone()))?;

        if self.git.current_branch()?.as_deref() != Some(branch.as_str()) {
            self.git.checkout_branch(&branch)?;
        }
        Ok(branch)
    }

    /// Commit staged work. When the commit is attributed to a feature its
    /// version moves to in progress within the same commit.
    pub fn commit(&self, message: &str, options: CommitOptions) -> Result<CommitOutcome> {
        self.ensure_no_merge()?;
        let branch = self.current_branch()?;
        if options.all {
            self.git.stage_tracked()?;
        }

        let set = self.store.load_all_branches()?;
        let attributed = match &options.feature {
            Some(query) => Some(set.find(query)?),
            None => set
                .owner_of_branch(&branch)
                .filter(|s| s.feature.state() != VersionState::Closed),
        };

        let mut changes = Vec::new();
        let mut updated = None;
        match attributed {
            Some(stored) => {
                if stored.branch != branch {
                    return Err(Error::InvalidTransition(format!(
                        "feature '{}' lives on branch {}, not {}",
                        stored.feature.name, stored.branch, branch
                    )));
                }
                let mut feature = stored.feature.clone();
                feature.touch(Utc::now()).map_err(Error::InvalidTransition)?;
                let head = self.git.head_commit()?;
                changes = self.store.tree_changes(&head.tree()?, &[&feature])?;
                updated = Some(feature);
            }
            None => {
                if !self.git.has_staged_changes()? {
                    return Err(Error::InvalidTransition("nothing to commit".to_string()));
                }
            }
        }

        let commit = self.git.commit_staged(message, &changes)?;
        if let Some(feature) = &updated {
            tracing::info!(feature = %feature.name, state = %feature.state(), "recorded work");
        }
        Ok(CommitOutcome {
            commit,
            feature: updated,
        })
    }

    /// Close the feature's active version by merging its branch into the
    /// base branch.
    pub fn merge(&self, query: &str, options: MergeOptions) -> Result<MergeOutcome> {
        self.ensure_no_merge()?;
        let set = self.store.load_all_branches()?;
        let stored = set.find(query)?.clone();
        let version = stored
            .feature
            .latest_version()
            .ok_or_else(|| Error::InvalidTransition("feature has no versions".to_string()))?;
        if version.closed_at.is_some() {
            return Err(Error::InvalidTransition(format!(
                "version {} of '{}' is already closed",
                version.number, stored.feature.name
            )));
        }
        let Some(branch) = stored.feature.active_branch().map(str::to_string) else {
            return self.close_in_place(&set, &stored);
        };
        let base = self.config.base_branch.clone();
        if branch == base {
            return Err(Error::InvalidTransition(format!(
                "version branch {} is the base branch",
                branch
            )));
        }

        self.git.ensure_clean()?;
        let branch_tip = self
            .git
            .branch_tip(&branch)?
            .ok_or_else(|| Error::BranchNotFound(branch.clone()))?;
        let original = self.git.current_branch()?;
        if original.as_deref() != Some(base.as_str()) {
            self.git.checkout_branch(&base)?;
        }
        let base_tip = self
            .git
            .branch_tip(&base)?
            .ok_or_else(|| Error::BranchNotFound(base.clone()))?;

        let state = MergeState {
            feature_id: stored.feature.id,
            feature_name: stored.feature.name.clone(),
            version: version.number,
            branch: branch.clone(),
            base_branch: base.clone(),
            base_tip: base_tip.to_string(),
            branch_tip: branch_tip.to_string(),
            original_branch: original.clone(),
            squash: options.squash,
            keep_branch: options.keep_branch,
            started_at: Utc::now(),
        };

        let result = self.merge_into_base(&set, &stored, &state, branch_tip, base_tip);
        if result.is_err() && !self.git.merge_in_progress() {
            if let Some(original) = original.filter(|o| o != &base) {
                if let Err(e) = self.git.checkout_branch(&original) {
                    tracing::warn!(branch = %original, "could not return to branch: {}", e);
                }
            }
        }
        result
    }

    fn merge_into_base(
        &self,
        set: &FeatureSet,
        stored: &StoredFeature,
        state: &MergeState,
        branch_tip: Oid,
        base_tip: Oid,
    ) -> Result<MergeOutcome> {
        let (branch, base) = (&state.branch, &state.base_branch);
        let kind = self.git.merge_kind(branch_tip)?;
        tracing::info!(feature = %stored.feature.name, branch = %branch, base = %base, ?kind, "merging");
        match (kind, state.squash) {
            (MergeKind::UpToDate, _) => {
                let mut closing = stored.feature.clone();
                closing.close(Utc::now()).map_err(Error::InvalidTransition)?;
                let message = format!("Close feature '{}' (v{})", closing.name, state.version);
                let commit = self.store.save(set, &closing, base, &message)?;
                let branch_deleted = self.cleanup_branch(state);
                Ok(MergeOutcome {
                    feature: closing,
                    mode: MergeMode::AlreadyMerged,
                    commit,
                    branch_deleted,
                })
            }
            (MergeKind::FastForward, false) => {
                let mut closing = stored.feature.clone();
                closing.close(Utc::now()).map_err(Error::InvalidTransition)?;
                let repo = self.git.raw();
                let tip = repo.find_commit(branch_tip)?;
                let tip_tree = tip.tree()?;
                let changes = self.store.tree_changes(&tip_tree, &[&closing])?;
                let tree = write_tree(repo, Some(&tip_tree), &changes)?;
                let message = format!("Close feature '{}' (v{})", closing.name, state.version);
                let commit = commit_changes(repo, &self.git.signature()?, &message, tree, &[&tip])?;
                self.git.fast_forward(base, base_tip, commit)?;
                let branch_deleted = self.cleanup_branch(state);
                Ok(MergeOutcome {
                    feature: closing,
                    mode: MergeMode::FastForward,
                    commit,
                    branch_deleted,
                })
            }
            _ => {
                state.save(&self.git.state_dir())?;
                if let Err(e) = self.git.start_merge(branch_tip) {
                    MergeState::clear(&self.git.state_dir())?;
                    self.git.raw().cleanup_state()?;
                    return Err(e);
                }
                self.resolve_metadata_conflicts()?;
                let remaining = self.git.conflicted_paths()?;
                if !remaining.is_empty() {
                    tracing::warn!(paths = ?remaining, "merge stopped on conflicts");
                    return Err(Error::MergeConflict { paths: remaining });
                }
                self.finish(state)
            }
        }
    }

    /// Finish a merge stopped on conflicts once they are resolved and staged.
    pub fn merge_continue(&self) -> Result<MergeOutcome> {
        let state_dir = self.git.state_dir();
        let state = MergeState::load(&state_dir)?.ok_or(Error::NoMergeInProgress)?;
        if !self.git.merge_in_progress() {
            MergeState::clear(&state_dir)?;
            return Err(Error::NoMergeInProgress);
        }
        self.resolve_metadata_conflicts()?;
        let remaining = self.git.conflicted_paths()?;
        if !remaining.is_empty() {
            return Err(Error::MergeConflict { paths: remaining });
        }
        self.finish(&state)
    }

    /// Throw away a pending merge: the base branch and working tree go back
    /// to where they were and the version stays open.
    pub fn merge_abort(&self) -> Result<MergeState> {
        let state_dir = self.git.state_dir();
        let state = MergeState::load(&state_dir)?.ok_or(Error::NoMergeInProgress)?;
        if !self.git.merge_in_progress() {
            MergeState::clear(&state_dir)?;
            return Err(Error::NoMergeInProgress);
        }
        let head = self.git.current_branch()?;
        if head.as_deref() != Some(state.base_branch.as_str()) {
            return Err(Error::InvalidTransition(format!(
                "the pending merge targets {} but HEAD is {}",
                state.base_branch,
                head.as_deref().unwrap_or("detached")
            )));
        }
        let base_tip = Oid::from_str(&state.base_tip)?;
        self.git.abort_merge(base_tip)?;
        MergeState::clear(&state_dir)?;
        if let Some(original) = &state.original_branch {
            if original != &state.base_branch {
                self.git.checkout_branch(original)?;
            }
        }
        tracing::info!(feature = %state.feature_name, "merge aborted");
        Ok(state)
    }

    fn finish(&self, state: &MergeState) -> Result<MergeOutcome> {
        let set = self.store.load_all_branches()?;
        let stored = set
            .get(&state.feature_id)
            .ok_or_else(|| Error::NotFound(state.feature_id.to_string()))?;
        let mut closing = stored.feature.clone();
        closing.close(Utc::now()).map_err(Error::InvalidTransition)?;

        let repo = self.git.raw();
        let merged = {
            let mut index = repo.index()?;
            repo.find_tree(index.write_tree()?)?
        };
        let changes = self.store.tree_changes(&merged, &[&closing])?;

        let base_tip = Oid::from_str(&state.base_tip)?;
        let branch_tip = Oid::from_str(&state.branch_tip)?;
        let (parents, verb, mode) = if state.squash {
            (vec![base_tip], "Squash", MergeMode::Squash)
        } else {
            (vec![base_tip, branch_tip], "Merge", MergeMode::Merge)
        };
        let message = format!(
            "{} feature '{}' (v{}) from {}",
            verb, closing.name, state.version, state.branch
        );
        let commit = self.git.finish_merge(&message, &parents, &changes)?;
        MergeState::clear(&self.git.state_dir())?;
        let branch_deleted = self.cleanup_branch(state);
        tracing::info!(feature = %closing.name, commit = %commit, "version closed");
        Ok(MergeOutcome {
            feature: closing,
            mode,
            commit,
            branch_deleted,
        })
    }

    /// Versions without a branch are closed on the branch that owns them.
    fn close_in_place(&self, set: &FeatureSet, stored: &StoredFeature) -> Result<MergeOutcome> {
        let mut closing = stored.feature.clone();
        closing.close(Utc::now()).map_err(Error::InvalidTransition)?;
        let message = format!("Close feature '{}'", closing.name);
        let commit = self.store.save(set, &closing, &stored.branch, &message)?;
        Ok(MergeOutcome {
            feature: closing,
            mode: MergeMode::CloseOnly,
            commit,
            branch_deleted: false,
        })
    }

    fn cleanup_branch(&self, state: &MergeState) -> bool {
        if state.keep_branch {
            return false;
        }
        match self.git.delete_branch(&state.branch) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(branch = %state.branch, "merged, but could not delete branch: {}", e);
                false
            }
        }
    }

    /// Settle conflicts inside the metadata directory: records keep the side
    /// modified last, the index file is rebuilt when the merge is committed.
    /// Anything else is left for the user.
    fn resolve_metadata_conflicts(&self) -> Result<()> {
        let dir = self.config.metadata_dir();
        let prefix = format!("{}/", dir);
        let index_file = index_path(dir);

        for conflict in self.git.conflicts()? {
            let path = conflict.path.as_str();
            if !path.starts_with(&prefix) {
                continue;
            }
            if path == index_file {
                let content = conflict.ours.as_ref().or(conflict.theirs.as_ref());
                self.git.resolve_conflict(path, content.map(Vec::as_slice))?;
                continue;
            }

            let ours = conflict.ours.as_ref().map(|b| parse_record(path, b)).transpose();
            let theirs = conflict.theirs.as_ref().map(|b| parse_record(path, b)).transpose();
            let (Ok(ours), Ok(theirs)) = (ours, theirs) else {
                tracing::warn!(path, "cannot resolve conflict in unparseable record");
                continue;
            };
            let keep = match (&ours, &theirs) {
                (Some(o), Some(t)) if t.modified_at > o.modified_at => conflict.theirs.as_deref(),
                (Some(_), _) => conflict.ours.as_deref(),
                (None, Some(_)) => conflict.theirs.as_deref(),
                (None, None) => None,
            };
            self.git.resolve_conflict(path, keep)?;
            tracing::info!(path, "resolved record conflict");
        }
        Ok(())
    }

    /// Start the next version of a closed feature.
    pub fn reopen(&self, query: &str) -> Result<Feature> {
        self.ensure_no_merge()?;
        let set = self.store.load_all_branches()?;
        let stored = set.find(query)?;
        let mut feature = stored.feature.clone();
        let next = feature
            .latest_version()
            .map(|v| v.number + 1)
            .unwrap_or(1);
        let message = format!("Reopen feature '{}' (v{})", feature.name, next);

        match self.config.creation_mode {
            CreationMode::BranchPerFeature => {
                let branch = self.version_branch(&feature.name, next);
                feature
                    .reopen(Some(branch.clone()), Utc::now())
                    .map_err(Error::InvalidTransition)?;
                let from = match set.tip(&stored.branch) {
                    Some(tip) => tip,
                    None => set
                        .remote_base(&stored.branch)
                        .ok_or_else(|| Error::BranchNotFound(stored.branch.clone()))?,
                };
                self.branch_and_checkout(&feature, &branch, from, &message)?;
            }
            CreationMode::TrunkBased => {
                feature
                    .reopen(None, Utc::now())
                    .map_err(Error::InvalidTransition)?;
                self.store.save(&set, &feature, &stored.branch, &message)?;
            }
        }
        tracing::info!(feature = %feature.name, version = next, "reopened");
        Ok(feature)
    }

    pub fn update(&self, query: &str, input: UpdateFeatureInput) -> Result<Feature> {
        if input.is_empty() {
            return Err(Error::InvalidInput("nothing to update".to_string()));
        }
        if input.name.as_ref().is_some_and(|n| n.trim().is_empty()) {
            return Err(Error::InvalidInput("feature name must not be empty".to_string()));
        }
        let set = self.store.load_all_branches()?;
        let stored = set.find(query)?;
        let mut feature = stored.feature.clone();
        feature.apply_update(input, Utc::now());
        let message = format!("Update feature '{}'", feature.name);
        self.store.save(&set, &feature, &stored.branch, &message)?;
        Ok(feature)
    }

    pub fn show(&self, query: &str, scope: Scope) -> Result<StoredFeature> {
        self.store.find_by_name_or_id(query, scope)
    }

    pub fn list(&self, filter: &ListFilter, scope: Scope) -> Result<Vec<StoredFeature>> {
        let set = self.store.load(scope)?;
        let mut features: Vec<StoredFeature> = set.iter().filter(|s| filter.matches(s)).cloned().collect();
        features.sort_by(|a, b| {
            a.feature
                .name
                .to_lowercase()
                .cmp(&b.feature.name.to_lowercase())
        });
        Ok(features)
    }

    pub fn status(&self) -> Result<Status> {
        let branch = self.git.current_branch()?;
        let pending = MergeState::load(&self.git.state_dir())?;
        let set = self.store.load_all_branches()?;
        let feature = branch
            .as_deref()
            .and_then(|b| set.owner_of_branch(b))
            .and_then(|stored| {
                let version = stored.feature.latest_version()?;
                Some(StatusFeature {
                    id: stored.feature.id,
                    name: stored.feature.name.clone(),
                    version: version.number,
                    state: version.state(),
                })
            });
        Ok(Status {
            branch,
            feature,
            merge_in_progress: self.git.merge_in_progress() || pending.is_some(),
            pending_merge: pending.map(|p| p.feature_name),
        })
    }
}

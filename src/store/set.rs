use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use git2::Oid;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::git::RefKind;
use crate::models::Feature;

const MIN_PREFIX: usize = 4;

/// A feature together with where it was found.
#[derive(Debug, Clone, Serialize)]
pub struct StoredFeature {
    pub feature: Feature,
    /// Local branch the record belongs to and is written back to.
    pub branch: String,
    /// Path of the record on that branch.
    pub path: String,
    /// Ref the winning copy was read from (`origin/x` for remote copies).
    pub source_ref: String,
    /// No local branch carries the record yet; the first write creates
    /// `branch` from the remote tip.
    pub remote_only: bool,
    /// Every ref carrying a copy of the record, sorted.
    pub refs: Vec<String>,
}

/// Two copies of one id whose contents disagree and neither contains the other.
#[derive(Debug, Clone, Serialize)]
pub struct Divergence {
    pub id: Uuid,
    pub name: String,
    pub kept_ref: String,
    pub other_ref: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MalformedRecord {
    pub refname: String,
    pub path: String,
    pub reason: String,
}

/// One parsed copy of a record.
#[derive(Debug, Clone)]
pub(crate) struct FoundRecord {
    pub refname: String,
    pub kind: RefKind,
    pub path: String,
    pub feature: Feature,
}

/// Unified, deduplicated view over the refs that were scanned.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    features: BTreeMap<Uuid, StoredFeature>,
    tips: HashMap<String, Oid>,
    remote_bases: HashMap<String, Oid>,
    current_branch: Option<String>,
    divergences: Vec<Divergence>,
    malformed: Vec<MalformedRecord>,
}

/// Local branch name a remote-tracking ref maps onto: `origin/feature/x`
/// becomes `feature/x`.
pub fn local_name(remote_ref: &str) -> &str {
    remote_ref
        .split_once('/')
        .map(|(_, rest)| rest)
        .unwrap_or(remote_ref)
}

pub(crate) struct Context<'c> {
    pub current_branch: Option<String>,
    pub base_branch: &'c str,
    /// Local branch tips.
    pub tips: HashMap<String, Oid>,
    /// Remote-tracking tips keyed by full short name (`origin/x`).
    pub remote_tips: HashMap<String, Oid>,
}

impl<'c> Context<'c> {
    /// Orders two copies of the same id; the greatest wins.
    fn rank(&self, a: &FoundRecord, b: &FoundRecord) -> Ordering {
        let current = self.current_branch.as_deref();
        a.feature
            .modified_at
            .cmp(&b.feature.modified_at)
            .then_with(|| (a.kind == RefKind::Local).cmp(&(b.kind == RefKind::Local)))
            .then_with(|| (Some(a.refname.as_str()) == current).cmp(&(Some(b.refname.as_str()) == current)))
            .then_with(|| (a.refname == self.base_branch).cmp(&(b.refname == self.base_branch)))
            .then_with(|| b.refname.cmp(&a.refname))
    }
}

impl FeatureSet {
    pub(crate) fn assemble(found: Vec<FoundRecord>, malformed: Vec<MalformedRecord>, ctx: Context<'_>) -> Self {
        let mut groups: HashMap<Uuid, Vec<FoundRecord>> = HashMap::new();
        for record in found {
            groups.entry(record.feature.id).or_default().push(record);
        }

        let mut features = BTreeMap::new();
        let mut divergences = Vec::new();
        let mut remote_bases = HashMap::new();

        for (id, copies) in groups {
            let Some(winner) = copies.iter().max_by(|a, b| ctx.rank(a, b)) else {
                continue;
            };

            for other in &copies {
                if other.feature != winner.feature && !winner.feature.subsumes(&other.feature) {
                    tracing::warn!(
                        %id,
                        kept = %winner.refname,
                        other = %other.refname,
                        "diverging copies of one feature"
                    );
                    divergences.push(Divergence {
                        id,
                        name: winner.feature.name.clone(),
                        kept_ref: winner.refname.clone(),
                        other_ref: other.refname.clone(),
                    });
                }
            }

            // Prefer the branch of the active version when it holds an
            // up-to-date copy; otherwise the ref the winner came from.
            let owner = winner
                .feature
                .active_branch()
                .and_then(|branch| {
                    copies.iter().find(|c| {
                        c.kind == RefKind::Local
                            && c.refname == branch
                            && c.feature.modified_at == winner.feature.modified_at
                    })
                })
                .unwrap_or(winner);

            let (branch, remote_only) = match owner.kind {
                RefKind::Local => (owner.refname.clone(), false),
                RefKind::Remote => {
                    let local = local_name(&owner.refname).to_string();
                    let exists = ctx.tips.contains_key(&local);
                    if !exists {
                        if let Some(tip) = ctx.remote_tips.get(&owner.refname) {
                            remote_bases.insert(local.clone(), *tip);
                        }
                    }
                    (local, !exists)
                }
            };

            let mut refs: Vec<String> = copies.iter().map(|c| c.refname.clone()).collect();
            refs.sort();
            refs.dedup();

            features.insert(
                id,
                StoredFeature {
                    feature: owner.feature.clone(),
                    branch,
                    path: owner.path.clone(),
                    source_ref: owner.refname.clone(),
                    remote_only,
                    refs,
                },
            );
        }

        divergences.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.other_ref.cmp(&b.other_ref)));

        Self {
            features,
            tips: ctx.tips,
            remote_bases,
            current_branch: ctx.current_branch,
            divergences,
            malformed,
        }
    }

    /// Set over records that all live on `branch`, without touching git.
    pub fn from_features(features: impl IntoIterator<Item = Feature>, branch: &str) -> Self {
        let found = features
            .into_iter()
            .map(|feature| FoundRecord {
                refname: branch.to_string(),
                kind: RefKind::Local,
                path: format!("{}.yaml", feature.id),
                feature,
            })
            .collect();
        Self::assemble(
            found,
            Vec::new(),
            Context {
                current_branch: Some(branch.to_string()),
                base_branch: branch,
                tips: HashMap::new(),
                remote_tips: HashMap::new(),
            },
        )
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn get(&self, id: &Uuid) -> Option<&StoredFeature> {
        self.features.get(id)
    }

    pub fn feature(&self, id: &Uuid) -> Option<&Feature> {
        self.features.get(id).map(|s| &s.feature)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.features.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoredFeature> {
        self.features.values()
    }

    pub fn features(&self) -> impl Iterator<Item = &Feature> + Clone {
        self.features.values().map(|s| &s.feature)
    }

    pub fn current_branch(&self) -> Option<&str> {
        self.current_branch.as_deref()
    }

    /// Tip of a local branch as seen when the set was loaded.
    pub fn tip(&self, branch: &str) -> Option<Oid> {
        self.tips.get(branch).copied()
    }

    /// Remote tip a missing local branch is created from on first write.
    pub fn remote_base(&self, branch: &str) -> Option<Oid> {
        self.remote_bases.get(branch).copied()
    }

    pub fn divergences(&self) -> &[Divergence] {
        &self.divergences
    }

    pub fn malformed(&self) -> &[MalformedRecord] {
        &self.malformed
    }

    /// The feature whose active version was given `branch`.
    pub fn owner_of_branch(&self, branch: &str) -> Option<&StoredFeature> {
        self.features
            .values()
            .find(|s| s.feature.active_branch() == Some(branch))
    }

    /// Resolve a full id, a case-insensitive name, or a unique id prefix of
    /// at least four hex digits.
    pub fn find(&self, query: &str) -> Result<&StoredFeature> {
        let query = query.trim();
        if let Ok(id) = Uuid::parse_str(query) {
            return self
                .features
                .get(&id)
                .ok_or_else(|| Error::NotFound(query.to_string()));
        }

        let lower = query.to_lowercase();
        let by_name: Vec<&StoredFeature> = self
            .features
            .values()
            .filter(|s| s.feature.name.to_lowercase() == lower)
            .collect();
        match by_name.as_slice() {
            [one] => return Ok(one),
            [] => {}
            many => {
                return Err(Error::AmbiguousName {
                    name: query.to_string(),
                    candidates: many.iter().map(|s| s.feature.id).collect(),
                })
            }
        }

        if lower.len() >= MIN_PREFIX && lower.chars().all(|c| c.is_ascii_hexdigit()) {
            let by_prefix: Vec<&StoredFeature> = self
                .features
                .values()
                .filter(|s| s.feature.id.simple().to_string().starts_with(&lower))
                .collect();
            match by_prefix.as_slice() {
                [one] => return Ok(one),
                [] => {}
                many => {
                    return Err(Error::AmbiguousName {
                        name: query.to_string(),
                        candidates: many.iter().map(|s| s.feature.id).collect(),
                    })
                }
            }
        }

        Err(Error::NotFound(query.to_string()))
    }
}

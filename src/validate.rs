//! Consistency sweep over the cross-branch graph.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::graph::{check_version_constraint, Catalog, CategoryGraph};
use crate::models::{ConstraintStatus, CycleDetection, Feature, Relationship};
use crate::store::{FeatureSet, FeatureStore, RecordWrite};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum IssueCode {
    /// Orphaned relationship.
    E001,
    /// Missing inverse relationship.
    E002,
    /// Malformed record.
    E003,
    /// Duplicate id with diverging content.
    E004,
    /// Cycle.
    E005,
    /// Version constraint violated.
    E006,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::E001 => "E001",
            Self::E002 => "E002",
            Self::E003 => "E003",
            Self::E004 => "E004",
            Self::E005 => "E005",
            Self::E006 => "E006",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::E001 => "orphaned relationship",
            Self::E002 => "missing inverse relationship",
            Self::E003 => "malformed feature record",
            Self::E004 => "duplicate feature id with diverging content",
            Self::E005 => "cycle",
            Self::E006 => "version constraint violated",
        }
    }

    /// Whether `--fix` repairs issues with this code.
    pub fn is_fixable(&self) -> bool {
        matches!(self, Self::E001 | Self::E002)
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// One finding. `relationship` is `(type, target id)` on `feature_id`.
#[derive(Debug, Clone, Serialize)]
pub struct Issue {
    pub code: IssueCode,
    pub severity: Severity,
    pub feature_id: Option<Uuid>,
    pub feature_name: Option<String>,
    pub relationship: Option<(String, Uuid)>,
    pub message: String,
}

impl Issue {
    fn on(code: IssueCode, severity: Severity, feature: &Feature, message: String) -> Self {
        Self {
            code,
            severity,
            feature_id: Some(feature.id),
            feature_name: Some(feature.name.clone()),
            relationship: None,
            message,
        }
    }

    fn with_relationship(mut self, rel: &Relationship) -> Self {
        self.relationship = Some((rel.kind.clone(), rel.target_id));
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FixReport {
    pub removed_orphans: usize,
    pub created_inverses: usize,
    pub refreshed_names: usize,
    /// Branches that could not be written; their fixes were not applied.
    pub warnings: Vec<String>,
}

pub struct Validator<'a> {
    catalog: &'a Catalog,
}

impl<'a> Validator<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    pub fn validate(&self, set: &FeatureSet) -> Vec<Issue> {
        let mut issues = Vec::new();

        for bad in set.malformed() {
            issues.push(Issue {
                code: IssueCode::E003,
                severity: Severity::Error,
                feature_id: None,
                feature_name: None,
                relationship: None,
                message: format!("{} on {}: {}", bad.path, bad.refname, bad.reason),
            });
        }

        for divergence in set.divergences() {
            issues.push(Issue {
                code: IssueCode::E004,
                severity: Severity::Error,
                feature_id: Some(divergence.id),
                feature_name: Some(divergence.name.clone()),
                relationship: None,
                message: format!(
                    "copies on {} and {} diverge; using {}",
                    divergence.kept_ref, divergence.other_ref, divergence.kept_ref
                ),
            });
        }

        for feature in set.features() {
            for rel in &feature.relationships {
                self.check_relationship(set, feature, rel, &mut issues);
            }
        }

        self.check_cycles(set, &mut issues);
        issues.sort_by(|a, b| {
            a.code
                .cmp(&b.code)
                .then_with(|| a.feature_name.cmp(&b.feature_name))
        });
        tracing::debug!(issues = issues.len(), "validated feature graph");
        issues
    }

    fn check_relationship(&self, set: &FeatureSet, feature: &Feature, rel: &Relationship, issues: &mut Vec<Issue>) {
        let Some(target) = set.feature(&rel.target_id) else {
            issues.push(
                Issue::on(
                    IssueCode::E001,
                    Severity::Error,
                    feature,
                    format!(
                        "{} {} {} ({}) does not resolve on any branch",
                        feature.name, rel.kind, rel.target_name, rel.target_id
                    ),
                )
                .with_relationship(rel),
            );
            return;
        };

        if self.catalog.get(&rel.kind).is_none() {
            tracing::warn!(feature = %feature.name, kind = %rel.kind, "record uses an unknown relationship type");
            return;
        }

        if let Some(complement) = self.catalog.complement(&rel.kind) {
            if target.relationship(complement, feature.id).is_none() {
                issues.push(
                    Issue::on(
                        IssueCode::E002,
                        Severity::Error,
                        feature,
                        format!(
                            "{} {} {} has no {} record on {}",
                            feature.name, rel.kind, target.name, complement, target.name
                        ),
                    )
                    .with_relationship(rel),
                );
            }
        }

        if check_version_constraint(set, rel) == ConstraintStatus::Violated {
            let constraint = rel
                .version_constraint
                .map(|c| c.to_string())
                .unwrap_or_default();
            let actual = target
                .latest_closed_version()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "none".to_string());
            issues.push(
                Issue::on(
                    IssueCode::E006,
                    Severity::Error,
                    feature,
                    format!(
                        "{} requires {} {}, latest closed version is {}",
                        feature.name, target.name, constraint, actual
                    ),
                )
                .with_relationship(rel),
            );
        }
    }

    fn check_cycles(&self, set: &FeatureSet, issues: &mut Vec<Issue>) {
        for category in self.catalog.checked_categories() {
            let severity = match category.effective_detection() {
                CycleDetection::Strict => Severity::Error,
                _ => Severity::Warning,
            };
            let graph = CategoryGraph::build(self.catalog, &category.name, set.features());
            for cycle in graph.cycles() {
                let names: Vec<String> = cycle
                    .iter()
                    .map(|id| {
                        set.feature(id)
                            .map(|f| f.name.clone())
                            .unwrap_or_else(|| id.to_string())
                    })
                    .collect();
                let start = cycle.first().and_then(|id| set.feature(id));
                issues.push(Issue {
                    code: IssueCode::E005,
                    severity,
                    feature_id: start.map(|f| f.id),
                    feature_name: start.map(|f| f.name.clone()),
                    relationship: None,
                    message: format!("cycle in category {}: {}", category.name, names.join(" -> ")),
                });
            }
        }
    }

    /// Repair what can be repaired: drop orphaned records, write missing
    /// inverses and refresh stale cached target names. Each branch is
    /// written on its own; a branch that fails is reported and skipped.
    pub fn fix(&self, store: &FeatureStore<'_>, set: &FeatureSet) -> Result<FixReport> {
        let mut report = FixReport::default();
        let mut edited: BTreeMap<Uuid, Feature> = BTreeMap::new();
        // Repairs are credited to the record they change and only counted
        // once that record's branch has been written.
        let mut pending: BTreeMap<Uuid, FixReport> = BTreeMap::new();
        let now = chrono::Utc::now();

        for feature in set.features() {
            for rel in &feature.relationships {
                let Some(target) = set.feature(&rel.target_id) else {
                    let entry = edited.entry(feature.id).or_insert_with(|| feature.clone());
                    if entry.remove_relationship(&rel.kind, rel.target_id) {
                        pending.entry(feature.id).or_default().removed_orphans += 1;
                    }
                    continue;
                };

                if rel.target_name != target.name {
                    let entry = edited.entry(feature.id).or_insert_with(|| feature.clone());
                    if let Some(r) = entry
                        .relationships
                        .iter_mut()
                        .find(|r| r.kind == rel.kind && r.target_id == rel.target_id)
                    {
                        r.target_name = target.name.clone();
                        pending.entry(feature.id).or_default().refreshed_names += 1;
                    }
                }

                let Some(complement) = self.catalog.complement(&rel.kind) else {
                    continue;
                };
                let target_entry = edited.entry(target.id).or_insert_with(|| target.clone());
                if target_entry.relationship(complement, feature.id).is_none() {
                    let mut back = Relationship::new(complement, feature.id, feature.name.clone(), now);
                    back.description = rel.description.clone();
                    target_entry.add_relationship(back);
                    pending.entry(target.id).or_default().created_inverses += 1;
                }
            }
        }

        let mut by_branch: BTreeMap<String, Vec<RecordWrite>> = BTreeMap::new();
        for (id, mut feature) in edited {
            let Some(stored) = set.get(&id) else {
                continue;
            };
            if feature == stored.feature {
                continue;
            }
            feature.mark_modified(now);
            by_branch
                .entry(stored.branch.clone())
                .or_default()
                .push(RecordWrite::new(feature, stored.branch.clone()));
        }

        for (branch, writes) in by_branch {
            match store.save_all(set, &writes, "Repair feature graph") {
                Ok(_) => {
                    for write in &writes {
                        if let Some(done) = pending.get(&write.feature.id) {
                            report.removed_orphans += done.removed_orphans;
                            report.created_inverses += done.created_inverses;
                            report.refreshed_names += done.refreshed_names;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(branch = %branch, "could not apply fixes: {}", e);
                    report
                        .warnings
                        .push(format!("{}: {} record(s) not repaired: {}", branch, writes.len(), e));
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_categories, default_relationship_types};
    use crate::models::CreateFeatureInput;
    use chrono::Utc;

    fn catalog() -> Catalog {
        Catalog::new(default_categories(), default_relationship_types()).unwrap()
    }

    fn feature(name: &str) -> Feature {
        Feature::new(CreateFeatureInput::named(name), None, Utc::now())
    }

    fn codes(issues: &[Issue]) -> Vec<IssueCode> {
        issues.iter().map(|i| i.code).collect()
    }

    #[test]
    fn inverse_pair_is_clean() {
        let (mut a, mut b) = (feature("A"), feature("B"));
        a.add_relationship(Relationship::new("depends-on", b.id, "B", Utc::now()));
        b.add_relationship(Relationship::new("required-by", a.id, "A", Utc::now()));
        let catalog = catalog();
        let issues = Validator::new(&catalog).validate(&FeatureSet::from_features([a, b], "main"));
        assert!(issues.is_empty(), "{:?}", issues);
    }

    #[test]
    fn reports_orphans_and_missing_inverses() {
        let (mut a, b) = (feature("A"), feature("B"));
        a.add_relationship(Relationship::new("depends-on", b.id, "B", Utc::now()));
        a.add_relationship(Relationship::new("relates-to", Uuid::new_v4(), "Gone", Utc::now()));
        let catalog = catalog();
        let issues = Validator::new(&catalog).validate(&FeatureSet::from_features([a, b], "main"));
        assert_eq!(codes(&issues), vec![IssueCode::E001, IssueCode::E002]);
        assert!(issues.iter().all(|i| i.code.is_fixable()));
    }

    #[test]
    fn warn_category_cycles_are_warnings() {
        let (mut a, mut b) = (feature("A"), feature("B"));
        a.add_relationship(Relationship::new("precedes", b.id, "B", Utc::now()));
        b.add_relationship(Relationship::new("follows", a.id, "A", Utc::now()));
        b.add_relationship(Relationship::new("precedes", a.id, "A", Utc::now()));
        a.add_relationship(Relationship::new("follows", b.id, "B", Utc::now()));
        let catalog = catalog();
        let issues = Validator::new(&catalog).validate(&FeatureSet::from_features([a, b], "main"));
        assert_eq!(codes(&issues), vec![IssueCode::E005]);
        assert_eq!(issues[0].severity, Severity::Warning);
        assert!(issues[0].message.starts_with("cycle in category workflow"));
    }

    #[test]
    fn violated_constraint_is_e006() {
        let (mut a, mut b) = (feature("A"), feature("B"));
        b.close(Utc::now()).unwrap();
        let mut rel = Relationship::new("relates-to", b.id, "B", Utc::now());
        rel.version_constraint = Some(">=2".parse().unwrap());
        a.add_relationship(rel);
        b.add_relationship(Relationship::new("relates-to", a.id, "A", Utc::now()));
        let catalog = catalog();
        let issues = Validator::new(&catalog).validate(&FeatureSet::from_features([a, b], "main"));
        assert_eq!(codes(&issues), vec![IssueCode::E006]);
        assert!(issues[0].message.contains(">=2"));
    }
}

//! Relationship graph engine.
//!
//! Relationship records live on the source feature; when a type declares an
//! inverse (or is bidirectional) a complementary record is written on the
//! target, on whatever branch owns it. Cycle checks run per category over
//! the normalized edge set from [`cycle`].

mod catalog;
pub mod cycle;
mod traverse;

use serde::Serialize;
use uuid::Uuid;

pub use catalog::{Catalog, Orientation};
pub use cycle::CategoryGraph;
pub use traverse::{Traversal, Visit};

use crate::error::{Error, Result};
use crate::models::{
    ConstraintStatus, CycleDetection, Feature, FeatureTreeNode, Relationship, VersionConstraint,
};
use crate::store::{FeatureSet, FeatureStore, RecordWrite, StoredFeature};

#[derive(Debug, Clone, Default)]
pub struct LinkOptions {
    pub description: Option<String>,
    pub version_constraint: Option<VersionConstraint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkOutcome {
    pub source: Feature,
    pub target: Feature,
    /// Type of the complementary record written on the target, if any.
    pub complement: Option<String>,
    /// Cycle warnings from categories in `warn` mode.
    pub warnings: Vec<String>,
}

pub struct RelationshipGraph<'a> {
    store: &'a FeatureStore<'a>,
    catalog: &'a Catalog,
}

fn names(set: &FeatureSet, ids: &[Uuid]) -> Vec<String> {
    ids.iter()
        .map(|id| {
            set.feature(id)
                .map(|f| f.name.clone())
                .unwrap_or_else(|| id.to_string())
        })
        .collect()
}

/// Bring cached `target_name`s on `feature` up to date with the set.
fn refresh_target_names(set: &FeatureSet, feature: &mut Feature) {
    for rel in &mut feature.relationships {
        if let Some(target) = set.feature(&rel.target_id) {
            if rel.target_name != target.name {
                rel.target_name = target.name.clone();
            }
        }
    }
}

/// Cycle that `source --kind--> target` would close in its category, as
/// feature ids, or `None`. Also `None` for categories that do not check.
pub fn closing_cycle(catalog: &Catalog, set: &FeatureSet, source: Uuid, target: Uuid, kind: &str) -> Result<Option<Vec<Uuid>>> {
    let category = catalog.category_of(kind)?;
    if category.effective_detection() == CycleDetection::None {
        return Ok(None);
    }
    let Some((from, to)) = cycle::normalize(catalog, kind, source, target) else {
        return Ok(None);
    };
    let graph = CategoryGraph::build(catalog, &category.name, set.features());
    Ok(graph.closing_path(from, to))
}

/// Resolve `relationship`'s constraint against the target's latest closed
/// version. Records without a constraint are always satisfied.
pub fn check_version_constraint(set: &FeatureSet, relationship: &Relationship) -> ConstraintStatus {
    let Some(constraint) = relationship.version_constraint else {
        return ConstraintStatus::Satisfied;
    };
    let latest = set
        .feature(&relationship.target_id)
        .and_then(Feature::latest_closed_version);
    constraint.evaluate(latest)
}

impl<'a> RelationshipGraph<'a> {
    pub fn new(store: &'a FeatureStore<'a>, catalog: &'a Catalog) -> Self {
        Self { store, catalog }
    }

    pub fn catalog(&self) -> &Catalog {
        self.catalog
    }

    /// Add `source --kind--> target` plus its complement.
    pub fn link(&self, set: &FeatureSet, source: &str, target: &str, kind: &str, options: LinkOptions) -> Result<LinkOutcome> {
        let ty = self.catalog.relationship_type(kind)?;
        let category = self.catalog.category_of(kind)?;
        let source = set.find(source)?;
        let target = set.find(target)?;
        let (src, tgt) = (&source.feature, &target.feature);

        if src.id == tgt.id {
            return Err(Error::SelfReference(src.id));
        }
        if src.relationship(&ty.name, tgt.id).is_some() {
            return Err(Error::DuplicateRelationship {
                source_name: src.name.clone(),
                target_name: tgt.name.clone(),
                kind: ty.name.clone(),
            });
        }

        let mut warnings = Vec::new();
        if let Some(ids) = closing_cycle(self.catalog, set, src.id, tgt.id, &ty.name)? {
            let path = names(set, &ids);
            match category.effective_detection() {
                CycleDetection::Strict => {
                    return Err(Error::Cycle {
                        category: category.name.clone(),
                        path,
                    })
                }
                CycleDetection::Warn => {
                    tracing::warn!(category = %category.name, "link closes a cycle: {}", path.join(" -> "));
                    warnings.push(format!(
                        "cycle in category {}: {}",
                        category.name,
                        path.join(" -> ")
                    ));
                }
                CycleDetection::None => {}
            }
        }

        let now = chrono::Utc::now();
        let mut new_source = src.clone();
        refresh_target_names(set, &mut new_source);
        let mut relationship = Relationship::new(ty.name.clone(), tgt.id, tgt.name.clone(), now);
        relationship.description = options.description.clone();
        relationship.version_constraint = options.version_constraint;
        new_source.add_relationship(relationship);
        new_source.mark_modified(now);

        let mut writes = vec![RecordWrite::new(new_source.clone(), source.branch.clone())];
        let complement = self.catalog.complement(&ty.name).map(str::to_string);
        let mut new_target = tgt.clone();
        if let Some(inverse) = &complement {
            let mut back = Relationship::new(inverse.clone(), src.id, src.name.clone(), now);
            back.description = options.description;
            if new_target.add_relationship(back) {
                new_target.mark_modified(now);
                writes.push(RecordWrite::new(new_target.clone(), target.branch.clone()));
            }
        }

        let message = format!("Link {} {} {}", src.name, ty.name, tgt.name);
        self.store.save_all(set, &writes, &message)?;
        tracing::info!(source = %src.name, target = %tgt.name, kind = %ty.name, "linked");

        Ok(LinkOutcome {
            source: new_source,
            target: new_target,
            complement,
            warnings,
        })
    }

    /// Remove `source --kind--> target` and its complement. Absent records
    /// are not an error; returns whether anything was removed.
    pub fn unlink(&self, set: &FeatureSet, source: &str, target: &str, kind: &str) -> Result<bool> {
        let ty = self.catalog.relationship_type(kind)?;
        let source = set.find(source)?;
        let (target_id, target): (Uuid, Option<&StoredFeature>) = match set.find(target) {
            Ok(stored) => (stored.feature.id, Some(stored)),
            // An orphaned edge can still be removed from the source side.
            Err(Error::NotFound(_)) => match Uuid::parse_str(target.trim()) {
                Ok(id) => (id, None),
                Err(_) => return Err(Error::NotFound(target.to_string())),
            },
            Err(e) => return Err(e),
        };

        let now = chrono::Utc::now();
        let mut writes = Vec::new();

        let mut new_source = source.feature.clone();
        if new_source.remove_relationship(&ty.name, target_id) {
            refresh_target_names(set, &mut new_source);
            new_source.mark_modified(now);
            writes.push(RecordWrite::new(new_source, source.branch.clone()));
        }

        if let (Some(complement), Some(target)) = (self.catalog.complement(&ty.name), target) {
            let mut new_target = target.feature.clone();
            if new_target.remove_relationship(complement, source.feature.id) {
                new_target.mark_modified(now);
                writes.push(RecordWrite::new(new_target, target.branch.clone()));
            }
        }

        if writes.is_empty() {
            tracing::debug!(source = %source.feature.name, kind = %ty.name, "nothing to unlink");
            return Ok(false);
        }
        let message = format!("Unlink {} {} {}", source.feature.name, ty.name, target_id);
        self.store.save_all(set, &writes, &message)?;
        Ok(true)
    }

    /// Features reachable over outgoing records of `types` (all when empty).
    pub fn traverse_descendants<'s>(&self, set: &'s FeatureSet, id: Uuid, types: &'s [String], max_depth: Option<usize>) -> Traversal<'s> {
        Traversal::new(set, id, max_depth, Traversal::outgoing(set, types))
    }

    /// Features that reach `id` over records of `types` (all when empty).
    pub fn traverse_ancestors<'s>(&self, set: &'s FeatureSet, id: Uuid, types: &'s [String], max_depth: Option<usize>) -> Traversal<'s> {
        Traversal::new(set, id, max_depth, Traversal::incoming(set, types))
    }

    /// Everything that transitively depends on `id`: reverse reachability
    /// over the normalized edges of every cycle-checked category.
    pub fn impacted<'s>(&self, set: &'s FeatureSet, id: Uuid, max_depth: Option<usize>) -> Traversal<'s> {
        let categories: Vec<&str> = self
            .catalog
            .checked_categories()
            .map(|c| c.name.as_str())
            .collect();
        let graph = CategoryGraph::build_many(self.catalog, &categories, set.features());
        let catalog = self.catalog.clone();
        Traversal::new(
            set,
            id,
            max_depth,
            Box::new(move |node| {
                graph
                    .predecessors(node)
                    .into_iter()
                    .map(|from| (from, edge_label(&catalog, set, from, node)))
                    .collect()
            }),
        )
    }

    pub fn check_version_constraint(&self, set: &FeatureSet, relationship: &Relationship) -> ConstraintStatus {
        check_version_constraint(set, relationship)
    }

    /// Descendant tree rooted at `id`. A feature already on the path from
    /// the root is not expanded again.
    pub fn tree(&self, set: &FeatureSet, id: Uuid, types: &[String], max_depth: Option<usize>) -> Option<FeatureTreeNode> {
        let mut path = Vec::new();
        build_node(set, id, None, types, 0, max_depth, &mut path)
    }
}

/// Canonical type name of the edge `from -> to`.
fn edge_label(catalog: &Catalog, set: &FeatureSet, from: Uuid, to: Uuid) -> String {
    let forward = set.feature(&from).and_then(|f| {
        f.relationships
            .iter()
            .find(|r| r.target_id == to && cycle::normalize(catalog, &r.kind, from, to) == Some((from, to)))
    });
    let backward = || {
        set.feature(&to).and_then(|f| {
            f.relationships
                .iter()
                .find(|r| r.target_id == from && cycle::normalize(catalog, &r.kind, to, from) == Some((from, to)))
        })
    };
    let kind = forward.or_else(backward).map(|r| r.kind.as_str());
    match kind.and_then(|k| catalog.orientation(k)) {
        Some(Orientation::Forward { canonical }) | Some(Orientation::Reversed { canonical }) => canonical.clone(),
        _ => kind.unwrap_or_default().to_string(),
    }
}

fn build_node(
    set: &FeatureSet,
    id: Uuid,
    via: Option<String>,
    types: &[String],
    depth: usize,
    max_depth: Option<usize>,
    path: &mut Vec<Uuid>,
) -> Option<FeatureTreeNode> {
    let feature = set.feature(&id)?;
    path.push(id);
    let mut children = Vec::new();
    if max_depth.map_or(true, |max| depth < max) {
        for rel in &feature.relationships {
            if !types.is_empty() && !types.contains(&rel.kind) {
                continue;
            }
            if path.contains(&rel.target_id) {
                continue;
            }
            if let Some(child) = build_node(set, rel.target_id, Some(rel.kind.clone()), types, depth + 1, max_depth, path) {
                children.push(child);
            }
        }
    }
    path.pop();
    children.sort_by(|a, b| a.name.cmp(&b.name));
    Some(FeatureTreeNode {
        id,
        name: feature.name.clone(),
        state: feature.state(),
        via,
        children,
    })
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

    fn link(from: &mut Feature, kind: &str, inverse: Option<&str>, to: &mut Feature) {
        from.add_relationship(Relationship::new(kind, to.id, to.name.clone(), Utc::now()));
        if let Some(inverse) = inverse {
            to.add_relationship(Relationship::new(inverse, from.id, from.name.clone(), Utc::now()));
        }
    }

    /// A depends-on B depends-on C, with inverses.
    fn chain() -> (FeatureSet, Uuid, Uuid, Uuid) {
        let (mut a, mut b, mut c) = (feature("A"), feature("B"), feature("C"));
        link(&mut a, "depends-on", Some("required-by"), &mut b);
        link(&mut b, "depends-on", Some("required-by"), &mut c);
        let ids = (a.id, b.id, c.id);
        (FeatureSet::from_features([a, b, c], "main"), ids.0, ids.1, ids.2)
    }

    #[test]
    fn closing_cycle_reports_path_from_target() {
        let catalog = catalog();
        let (set, a, b, c) = chain();
        let cycle = closing_cycle(&catalog, &set, c, a, "depends-on").unwrap();
        assert_eq!(cycle, Some(vec![a, b, c, a]));
        assert_eq!(names(&set, &[a, b, c, a]), vec!["A", "B", "C", "A"]);

        // The inverse spelling of the same edge closes the same loop.
        let cycle = closing_cycle(&catalog, &set, a, c, "required-by").unwrap();
        assert!(cycle.is_some());

        // Informational links never do.
        assert_eq!(closing_cycle(&catalog, &set, c, a, "duplicates").unwrap(), None);
    }

    #[test]
    fn descendants_and_ancestors_are_breadth_first() {
        let (set, a, b, c) = chain();
        let types = vec!["depends-on".to_string()];

        let descendants: Vec<(Uuid, usize)> = Traversal::new(&set, a, None, Traversal::outgoing(&set, &types))
            .map(|v| (v.feature.id, v.depth))
            .collect();
        assert_eq!(descendants, vec![(b, 1), (c, 2)]);

        let limited: Vec<Uuid> = Traversal::new(&set, a, Some(1), Traversal::outgoing(&set, &types))
            .map(|v| v.feature.id)
            .collect();
        assert_eq!(limited, vec![b]);

        let ancestors: Vec<Uuid> = Traversal::new(&set, c, None, Traversal::incoming(&set, &types))
            .map(|v| v.feature.id)
            .collect();
        assert_eq!(ancestors, vec![b, a]);
    }

    #[test]
    fn traversal_survives_cycles() {
        let (mut a, mut b) = (feature("A"), feature("B"));
        link(&mut a, "relates-to", Some("relates-to"), &mut b);
        let (a_id, b_id) = (a.id, b.id);
        let set = FeatureSet::from_features([a, b], "main");
        let visits: Vec<Uuid> = Traversal::new(&set, a_id, None, Traversal::outgoing(&set, &[]))
            .map(|v| v.feature.id)
            .collect();
        assert_eq!(visits, vec![b_id]);
    }

    #[test]
    fn tree_stops_at_features_already_on_the_path() {
        let (mut a, mut b) = (feature("A"), feature("B"));
        link(&mut a, "relates-to", Some("relates-to"), &mut b);
        let a_id = a.id;
        let set = FeatureSet::from_features([a, b], "main");

        let mut path = Vec::new();
        let tree = build_node(&set, a_id, None, &[], 0, None, &mut path).unwrap();
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].via.as_deref(), Some("relates-to"));
        assert!(tree.children[0].children.is_empty());
    }

    #[test]
    fn constraint_uses_latest_closed_version() {
        let (mut a, mut b) = (feature("A"), feature("B"));
        let mut rel = Relationship::new("depends-on", b.id, "B", Utc::now());
        rel.version_constraint = Some(">=2".parse().unwrap());
        a.add_relationship(rel.clone());

        let set = FeatureSet::from_features([a.clone(), b.clone()], "main");
        assert_eq!(check_version_constraint(&set, &rel), ConstraintStatus::Indeterminate);

        b.close(Utc::now()).unwrap();
        let set = FeatureSet::from_features([a.clone(), b.clone()], "main");
        assert_eq!(check_version_constraint(&set, &rel), ConstraintStatus::Violated);

        b.reopen(None, Utc::now()).unwrap();
        b.close(Utc::now()).unwrap();
        let set = FeatureSet::from_features([a, b], "main");
        assert_eq!(check_version_constraint(&set, &rel), ConstraintStatus::Satisfied);
    }
}

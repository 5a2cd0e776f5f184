//! Normalized per-category edge sets.
//!
//! A type and its declared inverse describe one edge. Every stored record is
//! mapped onto the canonical direction before it goes into the graph, so
//! `A depends-on B` and the generated `B required-by A` land on the same
//! `A -> B` edge and never look like a loop. Symmetric types carry no
//! direction and are left out.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use uuid::Uuid;

use super::catalog::{Catalog, Orientation};
use crate::models::Feature;

pub struct CategoryGraph {
    graph: DiGraphMap<Uuid, ()>,
}

/// Canonical `(from, to)` for a `source --kind--> target` record, or `None`
/// for symmetric and unknown types.
pub fn normalize(catalog: &Catalog, kind: &str, source: Uuid, target: Uuid) -> Option<(Uuid, Uuid)> {
    match catalog.orientation(kind)? {
        Orientation::Forward { .. } => Some((source, target)),
        Orientation::Reversed { .. } => Some((target, source)),
        Orientation::Symmetric => None,
    }
}

impl CategoryGraph {
    /// Edges of every record whose type belongs to `category`.
    pub fn build<'f>(catalog: &Catalog, category: &str, features: impl IntoIterator<Item = &'f Feature>) -> Self {
        let mut graph = DiGraphMap::new();
        for feature in features {
            graph.add_node(feature.id);
            for rel in &feature.relationships {
                let in_category = catalog
                    .get(&rel.kind)
                    .is_some_and(|ty| ty.category == category);
                if !in_category {
                    continue;
                }
                if let Some((from, to)) = normalize(catalog, &rel.kind, feature.id, rel.target_id) {
                    graph.add_edge(from, to, ());
                }
            }
        }
        Self { graph }
    }

    /// Union of the edges of several categories.
    pub fn build_many<'f>(
        catalog: &Catalog,
        categories: &[&str],
        features: impl IntoIterator<Item = &'f Feature> + Clone,
    ) -> Self {
        let mut merged = DiGraphMap::new();
        for category in categories {
            let part = Self::build(catalog, category, features.clone());
            for node in part.graph.nodes() {
                merged.add_node(node);
            }
            for (from, to, _) in part.graph.all_edges() {
                merged.add_edge(from, to, ());
            }
        }
        Self { graph: merged }
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn successors(&self, id: Uuid) -> Vec<Uuid> {
        if !self.graph.contains_node(id) {
            return Vec::new();
        }
        self.graph.neighbors(id).collect()
    }

    /// Nodes with an edge into `id`.
    pub fn predecessors(&self, id: Uuid) -> Vec<Uuid> {
        if !self.graph.contains_node(id) {
            return Vec::new();
        }
        self.graph
            .neighbors_directed(id, petgraph::Direction::Incoming)
            .collect()
    }

    /// Shortest path `from ..= to` following edge direction.
    pub fn path(&self, from: Uuid, to: Uuid) -> Option<Vec<Uuid>> {
        if from == to {
            return Some(vec![from]);
        }
        if !self.graph.contains_node(from) {
            return None;
        }
        let mut previous: HashMap<Uuid, Uuid> = HashMap::new();
        let mut seen: HashSet<Uuid> = HashSet::from([from]);
        let mut queue = VecDeque::from([from]);
        while let Some(node) = queue.pop_front() {
            for next in self.graph.neighbors(node) {
                if !seen.insert(next) {
                    continue;
                }
                previous.insert(next, node);
                if next == to {
                    let mut path = vec![to];
                    let mut cursor = to;
                    while let Some(&p) = previous.get(&cursor) {
                        path.push(p);
                        cursor = p;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// Cycle that adding `from -> to` would close, as `[to, .., from, to]`.
    pub fn closing_path(&self, from: Uuid, to: Uuid) -> Option<Vec<Uuid>> {
        if from == to {
            return Some(vec![from, from]);
        }
        let mut path = self.path(to, from)?;
        path.push(to);
        Some(path)
    }

    /// One closed walk per strongly connected component with a loop, each
    /// starting and ending at the component's smallest id.
    pub fn cycles(&self) -> Vec<Vec<Uuid>> {
        let mut cycles = Vec::new();
        for component in tarjan_scc(&self.graph) {
            let Some(&start) = component.iter().min() else {
                continue;
            };
            if component.len() == 1 {
                if self.graph.contains_edge(start, start) {
                    cycles.push(vec![start, start]);
                }
                continue;
            }
            let members: HashSet<Uuid> = component.iter().copied().collect();
            let mut next: Vec<Uuid> = self
                .graph
                .neighbors(start)
                .filter(|n| members.contains(n))
                .collect();
            next.sort();
            if let Some(walk) = next.first().and_then(|&n| self.path(n, start)) {
                let mut cycle = vec![start];
                cycle.extend(walk);
                cycles.push(cycle);
            }
        }
        cycles.sort();
        cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_categories, default_relationship_types};
    use crate::models::{CreateFeatureInput, Relationship};
    use chrono::Utc;

    fn catalog() -> Catalog {
        Catalog::new(default_categories(), default_relationship_types()).unwrap()
    }

    fn feature(name: &str) -> Feature {
        Feature::new(CreateFeatureInput::named(name), None, Utc::now())
    }

    fn link(from: &mut Feature, kind: &str, to: &Feature) {
        from.add_relationship(Relationship::new(kind, to.id, to.name.clone(), Utc::now()));
    }

    #[test]
    fn inverse_pair_is_one_edge() {
        let catalog = catalog();
        let mut a = feature("A");
        let mut b = feature("B");
        link(&mut a, "depends-on", &b);
        link(&mut b, "required-by", &a);

        let graph = CategoryGraph::build(&catalog, "structural", [&a, &b]);
        assert_eq!(graph.edge_count(), 1);
        assert!(graph.cycles().is_empty());
    }

    #[test]
    fn independent_edges_close_a_cycle() {
        let catalog = catalog();
        let mut a = feature("A");
        let mut b = feature("B");
        let mut c = feature("C");
        link(&mut a, "depends-on", &b);
        link(&mut b, "depends-on", &c);

        let graph = CategoryGraph::build(&catalog, "structural", [&a, &b, &c]);
        assert_eq!(graph.closing_path(c.id, a.id), Some(vec![a.id, b.id, c.id, a.id]));
        assert_eq!(graph.closing_path(a.id, c.id), None);

        link(&mut c, "depends-on", &a);
        let graph = CategoryGraph::build(&catalog, "structural", [&a, &b, &c]);
        let cycles = graph.cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), 4);
        assert_eq!(cycles[0].first(), cycles[0].last());
    }

    #[test]
    fn reversed_type_counts_against_canonical_direction() {
        let catalog = catalog();
        let mut a = feature("A");
        let mut b = feature("B");
        link(&mut a, "depends-on", &b);
        // "A required-by B" means B depends on A: the opposite direction.
        link(&mut a, "required-by", &b);

        let graph = CategoryGraph::build(&catalog, "structural", [&a, &b]);
        assert_eq!(graph.cycles().len(), 1);
    }

    #[test]
    fn other_categories_and_symmetric_types_are_ignored() {
        let catalog = catalog();
        let mut a = feature("A");
        let mut b = feature("B");
        link(&mut a, "relates-to", &b);
        link(&mut b, "relates-to", &a);
        link(&mut a, "precedes", &b);

        let structural = CategoryGraph::build(&catalog, "structural", [&a, &b]);
        assert_eq!(structural.edge_count(), 0);
        let informational = CategoryGraph::build(&catalog, "informational", [&a, &b]);
        assert_eq!(informational.edge_count(), 0);
        let workflow = CategoryGraph::build(&catalog, "workflow", [&a, &b]);
        assert_eq!(workflow.edge_count(), 1);
    }
}

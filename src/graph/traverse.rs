use std::collections::{HashSet, VecDeque};

use uuid::Uuid;

use crate::models::Feature;
use crate::store::FeatureSet;

type Neighbors<'s> = Box<dyn Fn(Uuid) -> Vec<(Uuid, String)> + 's>;

/// One step of a traversal.
#[derive(Debug, Clone)]
pub struct Visit<'s> {
    pub feature: &'s Feature,
    /// Hops from the starting feature; direct neighbors are at depth 1.
    pub depth: usize,
    /// Relationship type of the edge that reached this feature.
    pub via: String,
    pub parent: Uuid,
}

/// Lazy breadth-first walk. Each feature is yielded at most once, at its
/// shortest depth; ids that do not resolve in the set are skipped.
pub struct Traversal<'s> {
    set: &'s FeatureSet,
    neighbors: Neighbors<'s>,
    queue: VecDeque<(Uuid, usize)>,
    visited: HashSet<Uuid>,
    pending: VecDeque<Visit<'s>>,
    max_depth: Option<usize>,
}

impl<'s> Traversal<'s> {
    pub(crate) fn new(set: &'s FeatureSet, root: Uuid, max_depth: Option<usize>, neighbors: Neighbors<'s>) -> Self {
        Self {
            set,
            neighbors,
            queue: VecDeque::from([(root, 0)]),
            visited: HashSet::from([root]),
            pending: VecDeque::new(),
            max_depth,
        }
    }

    /// Outgoing records of `types` (all types when empty).
    pub(crate) fn outgoing(set: &'s FeatureSet, types: &'s [String]) -> Neighbors<'s> {
        Box::new(move |id| {
            set.feature(&id)
                .map(|f| {
                    f.relationships
                        .iter()
                        .filter(|r| types.is_empty() || types.contains(&r.kind))
                        .map(|r| (r.target_id, r.kind.clone()))
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    /// Features holding a record of `types` that points at the node.
    pub(crate) fn incoming(set: &'s FeatureSet, types: &'s [String]) -> Neighbors<'s> {
        Box::new(move |id| {
            set.features()
                .flat_map(move |f| {
                    f.relationships
                        .iter()
                        .filter(move |r| r.target_id == id)
                        .filter(move |r| types.is_empty() || types.contains(&r.kind))
                        .map(move |r| (f.id, r.kind.clone()))
                })
                .collect()
        })
    }
}

impl<'s> Iterator for Traversal<'s> {
    type Item = Visit<'s>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(visit) = self.pending.pop_front() {
                return Some(visit);
            }
            let (node, depth) = self.queue.pop_front()?;
            if self.max_depth.is_some_and(|max| depth >= max) {
                continue;
            }
            for (next, via) in (self.neighbors)(node) {
                let Some(feature) = self.set.feature(&next) else {
                    continue;
                };
                if !self.visited.insert(next) {
                    continue;
                }
                self.queue.push_back((next, depth + 1));
                self.pending.push_back(Visit {
                    feature,
                    depth: depth + 1,
                    via,
                    parent: node,
                });
            }
        }
    }
}

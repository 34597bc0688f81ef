//! Static Dependency Table and Load Planning
//!
//! The table is configuration: for each module the ordered list of modules it
//! declares as prerequisites, plus one total order of "critical" modules.
//! Planning a set of modules puts the critical ones first, sequentially, in
//! that order; the remainder is cut into batches of at most
//! `max_concurrency` modules, processed one batch after another.

use std::collections::{BTreeMap, HashSet};

use super::path::CanonicalId;

/// Declared prerequisites plus the critical-module order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DependencyTable {
    modules: BTreeMap<CanonicalId, Vec<CanonicalId>>,
    critical: Vec<CanonicalId>,
}

impl DependencyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the prerequisites of `id`, in order.
    pub fn with_dependencies<I, S>(mut self, id: impl Into<CanonicalId>, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CanonicalId>,
    {
        self.modules
            .insert(id.into(), deps.into_iter().map(Into::into).collect());
        self
    }

    /// Set the critical-module order.
    pub fn with_critical<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CanonicalId>,
    {
        self.critical = order.into_iter().map(Into::into).collect();
        self
    }

    /// Declared prerequisites of `id` (empty when undeclared).
    pub fn dependencies_of(&self, id: &CanonicalId) -> &[CanonicalId] {
        self.modules.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn critical_order(&self) -> &[CanonicalId] {
        &self.critical
    }

    /// Position of `id` in the critical order.
    pub fn critical_rank(&self, id: &CanonicalId) -> Option<usize> {
        self.critical.iter().position(|c| c == id)
    }

    pub fn is_critical(&self, id: &CanonicalId) -> bool {
        self.critical_rank(id).is_some()
    }

    /// Every module with declared prerequisites.
    pub fn modules(&self) -> impl Iterator<Item = (&CanonicalId, &[CanonicalId])> {
        self.modules.iter().map(|(id, deps)| (id, deps.as_slice()))
    }

    /// Order `ids` for loading.
    ///
    /// Duplicates are dropped (first occurrence wins). A `max_concurrency` of
    /// zero is treated as one.
    pub fn plan(&self, ids: &[CanonicalId], max_concurrency: usize) -> LoadPlan {
        let mut seen = HashSet::new();
        let unique: Vec<&CanonicalId> = ids.iter().filter(|id| seen.insert(*id)).collect();

        let mut critical: Vec<(usize, CanonicalId)> = Vec::new();
        let mut rest = Vec::new();
        for id in unique {
            match self.critical_rank(id) {
                Some(rank) => critical.push((rank, id.clone())),
                None => rest.push(id.clone()),
            }
        }
        critical.sort_by_key(|(rank, _)| *rank);

        LoadPlan {
            critical: critical.into_iter().map(|(_, id)| id).collect(),
            batches: rest
                .chunks(max_concurrency.max(1))
                .map(|chunk| chunk.to_vec())
                .collect(),
        }
    }
}

/// The order in which a set of modules is loaded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadPlan {
    /// Loaded one at a time, in this order, before any batch starts.
    pub critical: Vec<CanonicalId>,

    /// Loaded batch after batch; modules within a batch load concurrently.
    pub batches: Vec<Vec<CanonicalId>>,
}

impl LoadPlan {
    pub fn is_empty(&self) -> bool {
        self.critical.is_empty() && self.batches.is_empty()
    }

    /// Total number of modules in the plan.
    pub fn len(&self) -> usize {
        self.critical.len() + self.batches.iter().map(Vec::len).sum::<usize>()
    }
}

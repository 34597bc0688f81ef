//! Module Cache and In-Flight Registry
//!
//! The single mutable structure shared by every load. It maps canonical ids to:
//! - `ModuleRecord` - lifecycle state, surface, attempts, last error
//! - an in-flight load - one shared future per id, joined by later callers
//! - a `DeferredProxy` - issued while the id is part of a wait cycle
//!
//! It also keeps the Failed set and a wait-for graph (which in-flight load is
//! currently awaiting which id) used to detect cycles.
//!
//! Every method runs to completion without suspending, so under the
//! cooperative scheduler each one is atomic; the registry lock is never held
//! across an `.await`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use tracing::{debug, trace};

use super::error::LoadError;
use super::path::CanonicalId;
use super::proxy::DeferredProxy;
use super::record::{ModuleRecord, ModuleState};
use super::value::ModuleSurface;

/// Terminal result of one load, shared by every caller joined on it.
#[derive(Clone, Debug)]
pub enum LoadOutcome {
    Loaded(Arc<ModuleSurface>),
    /// Retries exhausted or a critical dependency failed. `fallback` is the
    /// substitute non-required callers receive.
    Failed {
        error: LoadError,
        fallback: Arc<ModuleSurface>,
    },
}

/// A load in progress.
pub type InFlight = Shared<BoxFuture<'static, LoadOutcome>>;

/// Result of `reserve`.
pub enum Reservation {
    /// No load was running; the caller's future is now the in-flight load.
    New(InFlight),
    /// A load was already running; the caller joins it.
    Joined(InFlight),
}

impl Reservation {
    pub fn is_new(&self) -> bool {
        matches!(self, Reservation::New(_))
    }

    pub fn into_in_flight(self) -> InFlight {
        match self {
            Reservation::New(f) | Reservation::Joined(f) => f,
        }
    }
}

/// Terminal transition requested by a finished load.
#[derive(Debug)]
pub enum Commit {
    Loaded {
        surface: Arc<ModuleSurface>,
        elapsed: Duration,
    },
    Failed {
        error: LoadError,
    },
}

/// Whether a commit was applied.
#[derive(Debug)]
pub enum Committed {
    /// Applied; carries the proxy issued for the id, if any, for binding.
    /// `restored` is the surface a failed refresh fell back to.
    Applied {
        proxy: Option<DeferredProxy>,
        restored: Option<Arc<ModuleSurface>>,
    },
    /// The record no longer belongs to this load (cleared or superseded).
    Stale,
}

struct FlightEntry {
    generation: u64,
    future: InFlight,
}

/// Registry of module records and in-flight loads.
#[derive(Default)]
pub struct ModuleRegistry {
    records: HashMap<CanonicalId, ModuleRecord>,
    in_flight: HashMap<CanonicalId, FlightEntry>,
    failed: BTreeSet<CanonicalId>,
    proxies: HashMap<CanonicalId, DeferredProxy>,

    /// owner -> (awaited id -> number of live awaits).
    waits_for: HashMap<CanonicalId, HashMap<CanonicalId, usize>>,

    next_generation: u64,

    /// Ids in the order their loads reached a terminal state.
    completion_order: Vec<CanonicalId>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The usable surface for `id` (Loaded or Fallback).
    pub fn get(&self, id: &CanonicalId) -> Option<Arc<ModuleSurface>> {
        self.records
            .get(id)
            .filter(|r| r.state().has_value())
            .and_then(|r| r.value().cloned())
    }

    pub fn record(&self, id: &CanonicalId) -> Option<&ModuleRecord> {
        self.records.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &ModuleRecord> {
        self.records.values()
    }

    /// State of `id`, `Unseen` when there is no record.
    pub fn state(&self, id: &CanonicalId) -> ModuleState {
        self.records
            .get(id)
            .map(ModuleRecord::state)
            .unwrap_or(ModuleState::Unseen)
    }

    pub fn is_failed(&self, id: &CanonicalId) -> bool {
        self.failed.contains(id)
    }

    pub fn failed_ids(&self) -> impl Iterator<Item = &CanonicalId> {
        self.failed.iter()
    }

    pub fn in_flight(&self, id: &CanonicalId) -> Option<InFlight> {
        self.in_flight.get(id).map(|entry| entry.future.clone())
    }

    pub fn is_loading(&self, id: &CanonicalId) -> bool {
        self.in_flight.contains_key(id)
    }

    pub fn loading_ids(&self) -> impl Iterator<Item = &CanonicalId> {
        self.in_flight.keys()
    }

    /// Join the in-flight load for `id`, or start one with `start`.
    ///
    /// `start` receives the generation that owns the record and must return
    /// the (not yet polled) load future.
    pub fn reserve<F>(&mut self, id: &CanonicalId, start: F) -> Reservation
    where
        F: FnOnce(u64) -> InFlight,
    {
        if let Some(entry) = self.in_flight.get(id) {
            trace!(target: "modshell::registry", %id, "Joining in-flight load");
            return Reservation::Joined(entry.future.clone());
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        self.records
            .entry(id.clone())
            .or_insert_with(|| ModuleRecord::new(id.clone()))
            .begin(generation);

        let future = start(generation);
        self.in_flight.insert(
            id.clone(),
            FlightEntry {
                generation,
                future: future.clone(),
            },
        );
        debug!(target: "modshell::registry", %id, generation, "Load reserved");
        Reservation::New(future)
    }

    /// Count one fetch attempt for the load owning `generation`.
    pub fn note_attempt(&mut self, id: &CanonicalId, generation: u64) {
        if let Some(record) = self.records.get_mut(id).filter(|r| r.accepts(generation)) {
            record.note_attempt();
        }
    }

    /// Apply a terminal transition, unless the load is stale.
    pub fn commit(&mut self, id: &CanonicalId, generation: u64, commit: Commit) -> Committed {
        if self
            .in_flight
            .get(id)
            .is_some_and(|entry| entry.generation == generation)
        {
            self.in_flight.remove(id);
        }

        let Some(record) = self.records.get_mut(id).filter(|r| r.accepts(generation)) else {
            debug!(target: "modshell::registry", %id, generation, "Ignoring stale completion");
            return Committed::Stale;
        };

        let mut restored = None;
        match commit {
            Commit::Loaded { surface, elapsed } => {
                record.mark_loaded(surface, elapsed);
                self.failed.remove(id);
            }
            Commit::Failed { error } => match record.mark_failed(error) {
                Some(surface) => restored = Some(surface),
                None => {
                    self.failed.insert(id.clone());
                }
            },
        }
        self.completion_order.retain(|c| c != id);
        self.completion_order.push(id.clone());

        Committed::Applied {
            proxy: self.proxies.remove(id),
            restored,
        }
    }

    /// Move a Failed record to Fallback with `surface`.
    ///
    /// Returns the surface callers should use: the one already installed if
    /// the record is Fallback, otherwise `surface`. The boolean reports
    /// whether `surface` was installed now.
    pub fn install_fallback(
        &mut self,
        id: &CanonicalId,
        surface: Arc<ModuleSurface>,
    ) -> (Arc<ModuleSurface>, bool) {
        match self.records.get_mut(id) {
            Some(record) if record.state() == ModuleState::Fallback => match record.value() {
                Some(existing) => (existing.clone(), false),
                None => {
                    record.mark_fallback(surface.clone());
                    (surface, true)
                }
            },
            Some(record) if record.state() == ModuleState::Failed => {
                record.mark_fallback(surface.clone());
                (surface, true)
            }
            _ => (surface, false),
        }
    }

    /// The proxy for `id`, created on first request.
    pub fn proxy_for(&mut self, id: &CanonicalId) -> DeferredProxy {
        self.proxies
            .entry(id.clone())
            .or_insert_with(|| DeferredProxy::new(id.clone()))
            .clone()
    }

    pub fn has_proxy(&self, id: &CanonicalId) -> bool {
        self.proxies.contains_key(id)
    }

    /// Remove the proxy for `id` unless a load for it is still running.
    pub fn take_orphaned_proxy(&mut self, id: &CanonicalId) -> Option<DeferredProxy> {
        if self.in_flight.contains_key(id) {
            return None;
        }
        self.proxies.remove(id)
    }

    /// Purge `ids` (or everything when `None`) from the cache and Failed set.
    ///
    /// A load in flight for a purged id keeps running for its current
    /// callers, but its completion is stale and will not be recorded.
    pub fn clear(&mut self, ids: Option<&[CanonicalId]>) -> usize {
        match ids {
            None => {
                let purged = self.records.len();
                self.records.clear();
                self.in_flight.clear();
                self.failed.clear();
                self.completion_order.clear();
                debug!(target: "modshell::registry", purged, "Cleared registry");
                purged
            }
            Some(ids) => {
                let mut purged = 0;
                for id in ids {
                    if self.records.remove(id).is_some() {
                        purged += 1;
                    }
                    self.in_flight.remove(id);
                    self.failed.remove(id);
                    self.completion_order.retain(|c| c != id);
                }
                debug!(target: "modshell::registry", purged, "Cleared modules");
                purged
            }
        }
    }

    /// Record that the load of `owner` is awaiting `dependency`.
    pub fn add_wait(&mut self, owner: &CanonicalId, dependency: &CanonicalId) {
        *self
            .waits_for
            .entry(owner.clone())
            .or_default()
            .entry(dependency.clone())
            .or_insert(0) += 1;
    }

    pub fn remove_wait(&mut self, owner: &CanonicalId, dependency: &CanonicalId) {
        if let Some(targets) = self.waits_for.get_mut(owner) {
            if let Some(count) = targets.get_mut(dependency) {
                *count -= 1;
                if *count == 0 {
                    targets.remove(dependency);
                }
            }
            if targets.is_empty() {
                self.waits_for.remove(owner);
            }
        }
    }

    /// Whether awaiting `target` from a load chain would wait on itself.
    ///
    /// True when `target` is in `chain` or its load transitively awaits an id
    /// in `chain`. An empty chain (a top-level caller) never deadlocks.
    pub fn would_deadlock(&self, target: &CanonicalId, chain: &[CanonicalId]) -> bool {
        if chain.is_empty() {
            return false;
        }
        let mut stack = vec![target];
        let mut visited = HashSet::new();
        while let Some(id) = stack.pop() {
            if chain.contains(id) {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            if let Some(targets) = self.waits_for.get(id) {
                stack.extend(targets.keys());
            }
        }
        false
    }

    /// Number of records in the Loaded state.
    pub fn loaded_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.state() == ModuleState::Loaded)
            .count()
    }

    /// Ids served by a fallback surface, sorted.
    pub fn fallback_ids(&self) -> Vec<CanonicalId> {
        let mut ids: Vec<_> = self
            .records
            .values()
            .filter(|r| r.state() == ModuleState::Fallback)
            .map(|r| r.id().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Durations of the successful loads currently recorded.
    pub fn load_times(&self) -> Vec<Duration> {
        self.records
            .values()
            .filter(|r| r.state() == ModuleState::Loaded)
            .filter_map(ModuleRecord::load_time)
            .collect()
    }

    pub fn completion_order(&self) -> &[CanonicalId] {
        &self.completion_order
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("records", &self.records.len())
            .field("in_flight", &self.in_flight.len())
            .field("failed", &self.failed.len())
            .field("proxies", &self.proxies.len())
            .finish()
    }
}

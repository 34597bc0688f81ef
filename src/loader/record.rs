//! Per-module load records.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::error::LoadError;
use super::path::CanonicalId;
use super::value::ModuleSurface;

/// The lifecycle state of a module.
///
/// `Unseen -> Loading -> Loaded`, or `Loading -> Failed` once retries are
/// exhausted, then `Failed -> Fallback` when a caller asks for a substitute.
/// A refresh (`Loaded -> Loading`) that fails returns to `Loaded`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ModuleState {
    Unseen,
    Loading,
    Loaded,
    Failed,
    Fallback,
}

impl ModuleState {
    /// Loaded or Fallback: the record holds a usable surface.
    pub fn has_value(&self) -> bool {
        matches!(self, ModuleState::Loaded | ModuleState::Fallback)
    }
}

/// The registry's record for one canonical id.
#[derive(Clone, Debug)]
pub struct ModuleRecord {
    id: CanonicalId,
    state: ModuleState,
    value: Option<Arc<ModuleSurface>>,
    attempts: u32,
    last_error: Option<LoadError>,

    /// Identifies the load that owns the record while `Loading`.
    /// Completions carrying another generation are stale and ignored.
    generation: u64,

    /// Wall time of the last successful load (dependencies included).
    load_time: Option<Duration>,

    /// The Loaded surface a refresh started from, restored if it fails.
    previous: Option<Arc<ModuleSurface>>,
}

impl ModuleRecord {
    pub fn new(id: CanonicalId) -> Self {
        Self {
            id,
            state: ModuleState::Unseen,
            value: None,
            attempts: 0,
            last_error: None,
            generation: 0,
            load_time: None,
            previous: None,
        }
    }

    pub fn id(&self) -> &CanonicalId {
        &self.id
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn value(&self) -> Option<&Arc<ModuleSurface>> {
        self.value.as_ref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&LoadError> {
        self.last_error.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn load_time(&self) -> Option<Duration> {
        self.load_time
    }

    /// Whether a completion for `generation` may still be applied.
    pub fn accepts(&self, generation: u64) -> bool {
        self.state == ModuleState::Loading && self.generation == generation
    }

    pub(crate) fn begin(&mut self, generation: u64) {
        self.previous = match self.state {
            ModuleState::Loaded => self.value.take(),
            _ => None,
        };
        self.state = ModuleState::Loading;
        self.generation = generation;
        self.value = None;
        self.attempts = 0;
        self.last_error = None;
    }

    pub(crate) fn note_attempt(&mut self) {
        self.attempts += 1;
    }

    pub(crate) fn mark_loaded(&mut self, surface: Arc<ModuleSurface>, elapsed: Duration) {
        self.state = ModuleState::Loaded;
        self.value = Some(surface);
        self.load_time = Some(elapsed);
        self.previous = None;
    }

    /// Record a failed load.
    ///
    /// A failed refresh of a Loaded module goes back to Loaded with the
    /// surface it had; that surface is returned. Otherwise the record is
    /// Failed and `None` is returned.
    pub(crate) fn mark_failed(&mut self, error: LoadError) -> Option<Arc<ModuleSurface>> {
        self.last_error = Some(error);
        match self.previous.take() {
            Some(surface) => {
                self.state = ModuleState::Loaded;
                self.value = Some(surface.clone());
                Some(surface)
            }
            None => {
                self.state = ModuleState::Failed;
                self.value = None;
                None
            }
        }
    }

    pub(crate) fn mark_fallback(&mut self, surface: Arc<ModuleSurface>) {
        self.state = ModuleState::Fallback;
        self.value = Some(surface);
    }
}

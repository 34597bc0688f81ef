//! Fetch Boundary
//!
//! The loader treats code fetching as an opaque asynchronous operation: given
//! a canonical id (and the dependencies already provided for it), produce the
//! module's exported surface or fail.
//!
//! Two fetchers ship with the crate:
//! - `FnFetcher` - adapts a closure
//! - `CatalogFetcher` - serves in-memory modules described in the manifest,
//!   with simulated failures and latency

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;

use super::path::CanonicalId;
use super::proxy::ModuleRef;
use super::value::{ModuleSurface, Value};

/// Why a single fetch attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct FetchFailure {
    reason: String,
}

impl FetchFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// One fetch attempt.
#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub id: CanonicalId,

    /// 1-based attempt number.
    pub attempt: u32,

    /// Declared dependencies provided before this fetch.
    /// A dependency caught in a cycle arrives as `ModuleRef::Deferred`.
    pub dependencies: BTreeMap<CanonicalId, ModuleRef>,
}

/// Source of module surfaces.
pub trait ModuleFetcher: Send + Sync {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<ModuleSurface, FetchFailure>>;
}

/// A fetcher backed by a closure.
pub struct FnFetcher<F> {
    f: F,
}

impl<F> FnFetcher<F>
where
    F: Fn(FetchRequest) -> BoxFuture<'static, Result<ModuleSurface, FetchFailure>> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ModuleFetcher for FnFetcher<F>
where
    F: Fn(FetchRequest) -> BoxFuture<'static, Result<ModuleSurface, FetchFailure>> + Send + Sync,
{
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<ModuleSurface, FetchFailure>> {
        (self.f)(request)
    }
}

impl<F> fmt::Debug for FnFetcher<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnFetcher")
    }
}

/// A simulated module (the `[catalog."<id>"]` manifest section).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct CatalogEntry {
    /// Exported members; each returns `"<id>::<member>"`.
    #[serde(default)]
    pub members: Vec<String>,

    /// Number of initial attempts that fail before the module is served.
    #[serde(default)]
    pub fail_attempts: u32,

    /// Simulated latency per attempt.
    #[serde(default)]
    pub delay_ms: u64,

    /// Never served: every attempt fails.
    #[serde(default)]
    pub missing: bool,
}

/// Serves modules from an in-memory catalog.
#[derive(Debug, Default)]
pub struct CatalogFetcher {
    entries: HashMap<CanonicalId, CatalogEntry>,
    attempts: Mutex<HashMap<CanonicalId, u32>>,
}

impl CatalogFetcher {
    pub fn new(entries: impl IntoIterator<Item = (CanonicalId, CatalogEntry)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch attempts seen so far for `id`.
    pub fn attempts_for(&self, id: &CanonicalId) -> u32 {
        self.attempts.lock().get(id).copied().unwrap_or(0)
    }

    fn build(id: &CanonicalId, entry: &CatalogEntry) -> ModuleSurface {
        entry
            .members
            .iter()
            .fold(ModuleSurface::new(id.clone()), |surface, member| {
                let text = format!("{}::{}", id, member);
                surface.with_function(member.clone(), move |_| Ok(Value::Str(text.clone())))
            })
    }
}

impl ModuleFetcher for CatalogFetcher {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<ModuleSurface, FetchFailure>> {
        let seen = {
            let mut attempts = self.attempts.lock();
            let count = attempts.entry(request.id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let result = match self.entries.get(&request.id) {
            None => Err(FetchFailure::new(format!("module '{}' not in catalog", request.id))),
            Some(entry) if entry.missing => {
                Err(FetchFailure::new(format!("module '{}' is unavailable", request.id)))
            }
            Some(entry) if seen <= entry.fail_attempts => Err(FetchFailure::new(format!(
                "simulated failure {} of {}",
                seen, entry.fail_attempts
            ))),
            Some(entry) => Ok(Self::build(&request.id, entry)),
        };
        let delay = self
            .entries
            .get(&request.id)
            .map(|e| Duration::from_millis(e.delay_ms))
            .unwrap_or_default();

        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            result
        }
        .boxed()
    }
}

/// Share a fetcher behind the trait object the loader stores.
pub fn shared<F: ModuleFetcher + 'static>(fetcher: F) -> Arc<dyn ModuleFetcher> {
    Arc::new(fetcher)
}

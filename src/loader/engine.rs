//! Module Loader
//!
//! `ModuleLoader` owns one registry and drives every load through it:
//!
//! 1. Resolve the reference to a canonical id
//! 2. Short-circuit on the Failed set, the cache, or an in-flight load
//! 3. Hand out a deferred proxy when awaiting would wait on itself
//! 4. Provide declared dependencies (critical order first, then batches)
//! 5. Fetch under the retry policy, commit, and bind any issued proxy
//!
//! # Scheduling
//!
//! Loads are never spawned. A load future runs on whichever task awaits it,
//! and every concurrent caller for one id awaits the same shared future, so
//! the fetcher sees at most one load per id at a time.
//!
//! # Cycles
//!
//! While a load awaits a dependency, the registry holds an edge
//! `owner -> dependency`. A request that would join a load which transitively
//! waits on the requester receives a `DeferredProxy` instead. The proxy
//! records calls and is bound (replaying them) when the owning load commits.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::cache::{Commit, Committed, InFlight, LoadOutcome, ModuleRegistry};
use super::deps::{DependencyTable, LoadPlan};
use super::error::{LoadError, LoadResult};
use super::events::LoaderObserver;
use super::fallback::FallbackSynthesizer;
use super::fetch::{FetchRequest, ModuleFetcher};
use super::health::{HealthReport, LoadReport};
use super::manifest::ShellManifest;
use super::path::{CanonicalId, PathResolver};
use super::proxy::{DeferredProxy, ModuleRef};
use super::record::{ModuleRecord, ModuleState};
use super::retry::RetryPolicy;
use super::value::ModuleSurface;

/// Relaxed settings used by `ModuleLoader::recover`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RecoveryPolicy {
    /// Multiplier applied to the normal per-attempt timeout.
    pub timeout_factor: f64,
    pub attempts: u32,
}

impl RecoveryPolicy {
    /// The per-attempt timeout used during recovery.
    ///
    /// A factor that is not a positive finite number, or that overflows the
    /// timeout, leaves `base` unchanged.
    pub fn scaled_timeout(&self, base: Duration) -> Duration {
        if !(self.timeout_factor.is_finite() && self.timeout_factor > 0.0) {
            return base;
        }
        Duration::try_from_secs_f64(base.as_secs_f64() * self.timeout_factor).unwrap_or(base)
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            timeout_factor: 2.0,
            attempts: 2,
        }
    }
}

/// Loader-wide settings.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoaderConfig {
    pub policy: RetryPolicy,

    /// Maximum number of modules loaded together in one batch.
    pub max_concurrency: usize,

    pub recovery: RecoveryPolicy,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            max_concurrency: 4,
            recovery: RecoveryPolicy::default(),
        }
    }
}

/// Per-call load options.
#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    /// Fail with an error instead of returning a fallback surface.
    pub required: bool,

    /// Per-attempt timeout; the loader default when unset.
    pub timeout: Option<Duration>,

    /// Maximum attempts; the loader default when unset.
    pub retries: Option<u32>,

    /// Fetch again even when a surface is cached. A failed refetch of a
    /// Loaded module keeps the surface it had.
    /// An in-flight load is still joined, and a Failed id is still not retried.
    pub skip_cache: bool,

    /// Dependencies whose failure aborts the dependent's load.
    pub critical_dependencies: BTreeSet<CanonicalId>,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    pub fn with_critical_dependency(mut self, id: impl Into<CanonicalId>) -> Self {
        self.critical_dependencies.insert(id.into());
        self
    }

    fn policy(&self, base: &RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            timeout: self.timeout.unwrap_or(base.timeout),
            attempts: self.retries.unwrap_or(base.attempts),
            delay: base.delay,
        }
    }

    /// Options for providing `dependency` on behalf of a load using `self`.
    fn for_dependency(&self, dependency: &CanonicalId) -> LoadOptions {
        LoadOptions {
            required: self.critical_dependencies.contains(dependency),
            timeout: self.timeout,
            retries: self.retries,
            skip_cache: false,
            critical_dependencies: self.critical_dependencies.clone(),
        }
    }
}

struct LoaderInner {
    resolver: PathResolver,
    table: DependencyTable,
    synthesizer: FallbackSynthesizer,
    fetcher: Arc<dyn ModuleFetcher>,
    config: LoaderConfig,
    registry: Mutex<ModuleRegistry>,
    observer: Option<Arc<dyn LoaderObserver>>,
}

impl LoaderInner {
    fn notify(&self, event: impl FnOnce(&dyn LoaderObserver)) {
        if let Some(observer) = &self.observer {
            event(observer.as_ref());
        }
    }
}

/// Builder for `ModuleLoader`.
pub struct LoaderBuilder {
    resolver: PathResolver,
    table: DependencyTable,
    synthesizer: FallbackSynthesizer,
    fetcher: Arc<dyn ModuleFetcher>,
    config: LoaderConfig,
    observer: Option<Arc<dyn LoaderObserver>>,
}

impl LoaderBuilder {
    pub fn new(fetcher: Arc<dyn ModuleFetcher>) -> Self {
        Self {
            resolver: PathResolver::new(),
            table: DependencyTable::new(),
            synthesizer: FallbackSynthesizer::default(),
            fetcher,
            config: LoaderConfig::default(),
            observer: None,
        }
    }

    /// Start from every table and setting in `manifest`.
    pub fn from_manifest(manifest: &ShellManifest, fetcher: Arc<dyn ModuleFetcher>) -> Self {
        Self::new(fetcher)
            .with_resolver(manifest.path_resolver())
            .with_dependencies(manifest.dependency_table())
            .with_fallbacks(manifest.fallback_synthesizer())
            .with_config(manifest.loader_config())
    }

    pub fn with_resolver(mut self, resolver: PathResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_dependencies(mut self, table: DependencyTable) -> Self {
        self.table = table;
        self
    }

    pub fn with_fallbacks(mut self, synthesizer: FallbackSynthesizer) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    pub fn with_config(mut self, config: LoaderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.policy = policy;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.config.max_concurrency = max_concurrency;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn LoaderObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> ModuleLoader {
        ModuleLoader {
            inner: Arc::new(LoaderInner {
                resolver: self.resolver,
                table: self.table,
                synthesizer: self.synthesizer,
                fetcher: self.fetcher,
                config: self.config,
                registry: Mutex::new(ModuleRegistry::new()),
                observer: self.observer,
            }),
        }
    }
}

/// Loads, caches, and supervises modules. Cloning shares the registry.
#[derive(Clone)]
pub struct ModuleLoader {
    inner: Arc<LoaderInner>,
}

impl ModuleLoader {
    pub fn builder(fetcher: Arc<dyn ModuleFetcher>) -> LoaderBuilder {
        LoaderBuilder::new(fetcher)
    }

    /// A loader with empty tables and default settings.
    pub fn new(fetcher: Arc<dyn ModuleFetcher>) -> Self {
        Self::builder(fetcher).build()
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    pub fn dependency_table(&self) -> &DependencyTable {
        &self.inner.table
    }

    /// Resolve a reference to its canonical id.
    ///
    /// A reference no rule matches resolves to itself; that is logged and
    /// otherwise not an error.
    pub fn resolve(&self, reference: &str) -> CanonicalId {
        let resolution = self.inner.resolver.resolve_detailed(reference);
        if !resolution.is_matched() {
            let ambiguous = LoadError::ResolutionAmbiguous {
                reference: reference.to_string(),
                id: resolution.id.clone(),
            };
            debug!(target: "modshell::resolve", error = %ambiguous, "Using best-effort id");
        }
        resolution.id
    }

    /// Provide one module.
    ///
    /// Without `required` this never fails: a module that cannot be loaded is
    /// replaced by its fallback surface. With `required` the caller receives
    /// `RetriesExhausted` or `CriticalDependencyFailed` instead.
    pub async fn load(&self, reference: &str, options: &LoadOptions) -> LoadResult<ModuleRef> {
        let id = self.resolve(reference);
        provide(self.inner.clone(), id, options.clone(), Vec::new()).await
    }

    /// Provide several modules, keyed by the references given.
    ///
    /// Critical modules load one at a time in critical order before any batch
    /// of the others starts.
    pub async fn load_many(
        &self,
        references: &[&str],
        options: &LoadOptions,
    ) -> LoadResult<BTreeMap<String, ModuleRef>> {
        let ids: Vec<CanonicalId> = references.iter().map(|r| self.resolve(r)).collect();
        let plan = self.inner.table.plan(&ids, self.inner.config.max_concurrency);
        debug!(
            target: "modshell::deps",
            critical = plan.critical.len(),
            batches = plan.batches.len(),
            "Loading module set"
        );

        let provided = provide_plan(&self.inner, plan, |_| options.clone(), &[])
            .await
            .map_err(|(_, e)| e)?;

        Ok(references
            .iter()
            .zip(ids)
            .filter_map(|(reference, id)| {
                provided
                    .get(&id)
                    .map(|module| (reference.to_string(), module.clone()))
            })
            .collect())
    }

    /// The order `references` would be loaded in by `load_many`.
    pub fn plan(&self, references: &[&str]) -> LoadPlan {
        let ids: Vec<CanonicalId> = references.iter().map(|r| self.resolve(r)).collect();
        self.inner.table.plan(&ids, self.inner.config.max_concurrency)
    }

    /// Forget `references` (or everything when `None`), Failed state included,
    /// so the next request fetches again. Returns the number of purged records.
    pub fn clear_failed(&self, references: Option<&[&str]>) -> usize {
        let ids: Option<Vec<CanonicalId>> =
            references.map(|refs| refs.iter().map(|r| self.resolve(r)).collect());
        self.clear_ids(ids.as_deref())
    }

    fn clear_ids(&self, ids: Option<&[CanonicalId]>) -> usize {
        // Loads detached from the registry must not be dropped under its lock.
        let detached: Vec<InFlight>;
        let purged = {
            let mut registry = self.inner.registry.lock();
            detached = match ids {
                Some(ids) => ids.iter().filter_map(|id| registry.in_flight(id)).collect(),
                None => registry
                    .loading_ids()
                    .filter_map(|id| registry.in_flight(id))
                    .collect(),
            };
            registry.clear(ids)
        };
        drop(detached);
        info!(target: "modshell::registry", purged, "Cleared module state");
        purged
    }

    pub fn report(&self) -> LoadReport {
        LoadReport::from_registry(&self.inner.registry.lock())
    }

    pub fn health(&self) -> HealthReport {
        HealthReport::from_registry(&self.inner.registry.lock(), &self.inner.table)
    }

    /// Snapshot of the record for `reference`.
    pub fn record(&self, reference: &str) -> Option<ModuleRecord> {
        let id = self.resolve(reference);
        self.inner.registry.lock().record(&id).cloned()
    }

    pub fn state(&self, reference: &str) -> ModuleState {
        let id = self.resolve(reference);
        self.inner.registry.lock().state(&id)
    }

    /// Ids in the order their loads finished.
    pub fn completion_order(&self) -> Vec<CanonicalId> {
        self.inner.registry.lock().completion_order().to_vec()
    }

    /// Re-attempt failed critical modules with relaxed timeouts.
    ///
    /// Does nothing while health is ok. Failed modules from the critical order
    /// are cleared and reloaded one at a time, in that order, with the
    /// per-attempt timeout scaled by the recovery factor. Returns the ids that
    /// loaded.
    pub async fn recover(&self) -> Vec<CanonicalId> {
        let health = self.health();
        if health.is_ok() {
            return Vec::new();
        }

        let failed: Vec<CanonicalId> = {
            let registry = self.inner.registry.lock();
            self.inner
                .table
                .critical_order()
                .iter()
                .filter(|id| registry.is_failed(id))
                .cloned()
                .collect()
        };
        if failed.is_empty() {
            return Vec::new();
        }

        let recovery = self.inner.config.recovery;
        let options = LoadOptions::new()
            .required()
            .with_timeout(recovery.scaled_timeout(self.inner.config.policy.timeout))
            .with_retries(recovery.attempts);
        warn!(
            target: "modshell::health",
            status = ?health.status,
            modules = failed.len(),
            "Entering recovery"
        );

        let mut recovered = Vec::new();
        for id in failed {
            self.clear_ids(Some(std::slice::from_ref(&id)));
            match provide(self.inner.clone(), id.clone(), options.clone(), Vec::new()).await {
                Ok(_) => {
                    info!(target: "modshell::health", %id, "Module recovered");
                    recovered.push(id);
                }
                Err(e) => {
                    warn!(target: "modshell::health", %id, error = %e, "Recovery failed");
                }
            }
        }
        recovered
    }
}

impl fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("config", &self.inner.config)
            .field("registry", &*self.inner.registry.lock())
            .finish()
    }
}

/// What a request for an id turns into, decided under the registry lock.
enum Admission {
    Cached(Arc<ModuleSurface>),
    Deferred(DeferredProxy),
    PreviouslyFailed {
        error: LoadError,
        fallback: Option<Arc<ModuleSurface>>,
    },
    Await(InFlight),
}

/// Removes a wait-for edge when the awaiting future finishes or is dropped.
struct WaitGuard {
    inner: Arc<LoaderInner>,
    owner: CanonicalId,
    dependency: CanonicalId,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.inner
            .registry
            .lock()
            .remove_wait(&self.owner, &self.dependency);
    }
}

/// Provide `id` to the load chain `chain` (empty for a top-level caller).
fn provide(
    inner: Arc<LoaderInner>,
    id: CanonicalId,
    options: LoadOptions,
    chain: Vec<CanonicalId>,
) -> BoxFuture<'static, LoadResult<ModuleRef>> {
    async move {
        let admission = {
            let mut registry = inner.registry.lock();
            if registry.is_failed(&id) {
                let error = registry
                    .record(&id)
                    .and_then(|r| r.last_error().cloned())
                    .unwrap_or_else(|| previously_failed(&id));
                Admission::PreviouslyFailed {
                    error,
                    fallback: registry.get(&id),
                }
            } else if let Some(surface) = registry.get(&id).filter(|_| !options.skip_cache) {
                Admission::Cached(surface)
            } else if registry.is_loading(&id) && registry.would_deadlock(&id, &chain) {
                Admission::Deferred(registry.proxy_for(&id))
            } else {
                let reservation = registry.reserve(&id, |generation| {
                    run_load(
                        inner.clone(),
                        id.clone(),
                        generation,
                        options.clone(),
                        chain.clone(),
                    )
                    .boxed()
                    .shared()
                });
                if let Some(owner) = chain.last() {
                    registry.add_wait(owner, &id);
                }
                Admission::Await(reservation.into_in_flight())
            }
        };

        match admission {
            Admission::Cached(surface) => Ok(ModuleRef::Ready(surface)),
            Admission::Deferred(proxy) => {
                debug!(target: "modshell::proxy", %id, chain = ?chain, "Cycle detected, issuing deferred proxy");
                Ok(ModuleRef::Deferred(proxy))
            }
            Admission::PreviouslyFailed { error, .. } if options.required => Err(error),
            Admission::PreviouslyFailed {
                fallback: Some(surface),
                ..
            } => Ok(ModuleRef::Ready(surface)),
            Admission::PreviouslyFailed { fallback: None, .. } => {
                let substitute = inner.synthesizer.synthesize(&id);
                Ok(ModuleRef::Ready(install_fallback(&inner, &id, substitute)))
            }
            Admission::Await(in_flight) => {
                let wait = chain.last().map(|owner| WaitGuard {
                    inner: inner.clone(),
                    owner: owner.clone(),
                    dependency: id.clone(),
                });
                let outcome = in_flight.await;
                drop(wait);

                match outcome {
                    LoadOutcome::Loaded(surface) => Ok(ModuleRef::Ready(surface)),
                    LoadOutcome::Failed { error, .. } if options.required => Err(error),
                    LoadOutcome::Failed { fallback, .. } => {
                        Ok(ModuleRef::Ready(install_fallback(&inner, &id, fallback)))
                    }
                }
            }
        }
    }
    .boxed()
}

fn previously_failed(id: &CanonicalId) -> LoadError {
    LoadError::RetriesExhausted {
        id: id.clone(),
        attempts: 0,
        last: Box::new(LoadError::FetchFailed {
            id: id.clone(),
            attempt: 0,
            reason: "previously failed".to_string(),
        }),
    }
}

/// Serve `substitute` for a failed id, or the fallback already installed.
fn install_fallback(
    inner: &LoaderInner,
    id: &CanonicalId,
    substitute: Arc<ModuleSurface>,
) -> Arc<ModuleSurface> {
    let (surface, fresh) = inner.registry.lock().install_fallback(id, substitute);
    if fresh {
        warn!(target: "modshell::fallback", %id, "Serving fallback surface");
        inner.notify(|o| o.fallback_installed(id));
    }
    surface
}

/// Provide every module in `plan`: critical ones in order, then each batch
/// concurrently. Stops at the first error, returning the id that failed.
async fn provide_plan<F>(
    inner: &Arc<LoaderInner>,
    plan: LoadPlan,
    options_for: F,
    chain: &[CanonicalId],
) -> Result<BTreeMap<CanonicalId, ModuleRef>, (CanonicalId, LoadError)>
where
    F: Fn(&CanonicalId) -> LoadOptions,
{
    let mut provided = BTreeMap::new();

    for id in plan.critical {
        debug!(target: "modshell::deps", %id, "Loading critical module");
        match provide(inner.clone(), id.clone(), options_for(&id), chain.to_vec()).await {
            Ok(module) => {
                provided.insert(id, module);
            }
            Err(e) => return Err((id, e)),
        }
    }

    for batch in plan.batches {
        debug!(target: "modshell::deps", size = batch.len(), "Loading batch");
        let loads = batch
            .iter()
            .map(|id| provide(inner.clone(), id.clone(), options_for(id), chain.to_vec()));
        let results = join_all(loads).await;
        for (id, result) in batch.into_iter().zip(results) {
            match result {
                Ok(module) => {
                    provided.insert(id, module);
                }
                Err(e) => return Err((id, e)),
            }
        }
    }

    Ok(provided)
}

/// The body of one in-flight load for `id`, owning record generation
/// `generation`.
async fn run_load(
    inner: Arc<LoaderInner>,
    id: CanonicalId,
    generation: u64,
    options: LoadOptions,
    mut chain: Vec<CanonicalId>,
) -> LoadOutcome {
    let started = Instant::now();
    chain.push(id.clone());

    let plan = inner
        .table
        .plan(inner.table.dependencies_of(&id), inner.config.max_concurrency);
    if !plan.is_empty() {
        debug!(target: "modshell::deps", %id, count = plan.len(), "Providing dependencies");
    }

    let result = match provide_plan(&inner, plan, |dep| options.for_dependency(dep), &chain).await {
        Err((dependency, cause)) => Err(LoadError::CriticalDependencyFailed {
            id: id.clone(),
            dependency,
            reason: cause.to_string(),
        }),
        Ok(dependencies) => {
            let policy = options.policy(&inner.config.policy);
            policy
                .run(&id, |attempt| {
                    inner.registry.lock().note_attempt(&id, generation);
                    inner.fetcher.fetch(FetchRequest {
                        id: id.clone(),
                        attempt,
                        dependencies: dependencies.clone(),
                    })
                })
                .await
                .map(|attempted| attempted.value)
        }
    };

    finish(&inner, &id, generation, result, started.elapsed())
}

/// Commit a finished load and bind any proxy issued for it.
fn finish(
    inner: &LoaderInner,
    id: &CanonicalId,
    generation: u64,
    result: LoadResult<ModuleSurface>,
    elapsed: Duration,
) -> LoadOutcome {
    let (outcome, commit) = match result {
        Ok(surface) => {
            let surface = Arc::new(surface);
            (
                LoadOutcome::Loaded(surface.clone()),
                Commit::Loaded { surface, elapsed },
            )
        }
        Err(error) => (
            LoadOutcome::Failed {
                error: error.clone(),
                fallback: inner.synthesizer.synthesize(id),
            },
            Commit::Failed { error },
        ),
    };

    let (applied, proxy, restored) = {
        let mut registry = inner.registry.lock();
        match registry.commit(id, generation, commit) {
            Committed::Applied { proxy, restored } => (true, proxy, restored),
            Committed::Stale => (false, registry.take_orphaned_proxy(id), None),
        }
    };

    let outcome = match (restored, outcome) {
        (Some(surface), outcome) => {
            if let LoadOutcome::Failed { error, .. } = &outcome {
                warn!(target: "modshell::registry", %id, error = %error, "Refresh failed, keeping loaded surface");
            }
            LoadOutcome::Loaded(surface)
        }
        (None, outcome) => {
            if applied {
                match &outcome {
                    LoadOutcome::Loaded(_) => {
                        info!(
                            target: "modshell::registry",
                            %id,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Module loaded"
                        );
                        inner.notify(|o| o.module_loaded(id, elapsed));
                    }
                    LoadOutcome::Failed { error, .. } => {
                        error!(target: "modshell::registry", %id, error = %error, "Module failed to load");
                        inner.notify(|o| o.module_failed(id, error));
                    }
                }
            }
            outcome
        }
    };

    if let Some(proxy) = proxy {
        let surface = match &outcome {
            LoadOutcome::Loaded(surface) => surface.clone(),
            // Lookups after binding must see what the proxy forwards to
            LoadOutcome::Failed { fallback, .. } if applied => {
                install_fallback(inner, id, fallback.clone())
            }
            LoadOutcome::Failed { fallback, .. } => fallback.clone(),
        };
        let summary = proxy.bind(surface);
        inner.notify(|o| o.proxy_bound(id, summary.replayed));
    }

    outcome
}

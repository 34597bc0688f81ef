//! Shared helpers for loader integration tests.
//!
//! `ScriptedFetcher` serves modules according to a per-id script (fail the
//! first N attempts, fail forever, hang, add latency) and records every fetch
//! so tests can count invocations and check ordering.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;

use modshell::loader::{
    CanonicalId, FetchFailure, FetchRequest, ModuleFetcher, ModuleSurface, PathResolver, Value,
};

type SurfaceFn = Arc<dyn Fn(&CanonicalId) -> ModuleSurface + Send + Sync>;
type FetchHook = Arc<dyn Fn(&FetchRequest) + Send + Sync>;

#[derive(Clone, Default)]
struct Script {
    fail_first: u32,
    always_fail: bool,
    hang: bool,
    delay: Duration,
    surface: Option<SurfaceFn>,
    hook: Option<FetchHook>,
}

/// A fetcher driven by per-module scripts. Unscripted ids load immediately
/// with an echo surface.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<CanonicalId, Script>>,
    calls: Mutex<Vec<(CanonicalId, u32)>>,
    events: Arc<Mutex<Vec<String>>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self, id: &str, edit: impl FnOnce(&mut Script)) {
        let mut scripts = self.scripts.lock();
        edit(scripts.entry(CanonicalId::from(id)).or_default());
    }

    /// Fail the first `n` attempts, then succeed.
    pub fn fail_times(&self, id: &str, n: u32) {
        self.script(id, |s| s.fail_first = n);
    }

    pub fn fail_always(&self, id: &str) {
        self.script(id, |s| s.always_fail = true);
    }

    /// Never complete.
    pub fn hang(&self, id: &str) {
        self.script(id, |s| s.hang = true);
    }

    pub fn delay(&self, id: &str, delay: Duration) {
        self.script(id, |s| s.delay = delay);
    }

    pub fn surface(
        &self,
        id: &str,
        build: impl Fn(&CanonicalId) -> ModuleSurface + Send + Sync + 'static,
    ) {
        self.script(id, |s| s.surface = Some(Arc::new(build)));
    }

    /// Run `hook` synchronously whenever `id` is fetched.
    pub fn on_fetch(&self, id: &str, hook: impl Fn(&FetchRequest) + Send + Sync + 'static) {
        self.script(id, |s| s.hook = Some(Arc::new(hook)));
    }

    /// Number of fetch invocations for `id`.
    pub fn calls_for(&self, id: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(called, _)| called.as_str() == id)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// `"start <id>"` / `"end <id>"` entries in the order they happened.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events.lock().iter().position(|e| e == event)
    }

    /// Highest number of fetches observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl ModuleFetcher for ScriptedFetcher {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<ModuleSurface, FetchFailure>> {
        let id = request.id.clone();
        let script = self.scripts.lock().get(&id).cloned().unwrap_or_default();
        let attempt = {
            let mut calls = self.calls.lock();
            calls.push((id.clone(), request.attempt));
            calls.iter().filter(|(called, _)| *called == id).count() as u32
        };

        if let Some(hook) = &script.hook {
            hook(&request);
        }

        let events = self.events.clone();
        let active = self.active.clone();
        let peak = self.peak.clone();
        events.lock().push(format!("start {}", id));
        let running = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(running, Ordering::SeqCst);

        async move {
            if script.hang {
                futures::future::pending::<()>().await;
            }
            if !script.delay.is_zero() {
                tokio::time::sleep(script.delay).await;
            }
            active.fetch_sub(1, Ordering::SeqCst);
            events.lock().push(format!("end {}", id));

            if script.always_fail {
                return Err(FetchFailure::new(format!("{} is unavailable", id)));
            }
            if attempt <= script.fail_first {
                return Err(FetchFailure::new(format!("{} failed attempt {}", id, attempt)));
            }
            Ok(match &script.surface {
                Some(build) => build(&id),
                None => echo_surface(&id),
            })
        }
        .boxed()
    }
}

/// A surface whose `name` member returns the module id.
pub fn echo_surface(id: &CanonicalId) -> ModuleSurface {
    let name = id.to_string();
    ModuleSurface::new(id.clone()).with_function("name", move |_| Ok(Value::Str(name.clone())))
}

/// A surface whose `push` member appends its first argument to `log`.
pub fn logging_surface(id: &CanonicalId, log: Arc<Mutex<Vec<String>>>) -> ModuleSurface {
    ModuleSurface::new(id.clone()).with_function("push", move |args| {
        let mut log = log.lock();
        if let Some(Value::Str(s)) = args.first() {
            log.push(s.clone());
        }
        Ok(Value::Int(log.len() as i64))
    })
}

/// Resolver placing the usual shell modules under `core/`.
pub fn shell_resolver() -> PathResolver {
    PathResolver::new()
        .with_category("errorHandler", "core")
        .with_category("uiRegistry", "core")
        .with_category("stateManager", "core")
        .with_override("app", "core/app")
}

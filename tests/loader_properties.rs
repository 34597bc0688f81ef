//! Integration tests for the module loader.
//!
//! These tests verify:
//! - Reference resolution is idempotent across reference shapes
//! - At most one fetch is in flight per module
//! - Dependency cycles resolve through deferred proxies with call replay
//! - Retry bounds, timeouts, and late completions
//! - Fallback surfaces never fail and stay awaitable
//! - Critical ordering and batch concurrency in `load_many`
//! - Clearing Failed state, recovery, and loader events

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;

use common::{echo_surface, logging_surface, shell_resolver, ScriptedFetcher};
use modshell::loader::{
    CallError, CanonicalId, DependencyTable, Dispatch, EventBus, ExpectedExports,
    FallbackSynthesizer, HealthStatus, LoadError, LoadOptions, LoaderBuilder, LoaderConfig,
    LoaderEvent, ModuleLoader, ModuleState, PendingReply, RecoveryPolicy, RetryPolicy, Value,
};

fn fast_policy() -> RetryPolicy {
    RetryPolicy::default()
        .with_timeout(Duration::from_secs(1))
        .with_delay(Duration::from_millis(100))
}

fn builder(fetcher: &Arc<ScriptedFetcher>) -> LoaderBuilder {
    ModuleLoader::builder(fetcher.clone())
        .with_resolver(shell_resolver())
        .with_policy(fast_policy())
}

// ============================================================
// Resolution
// ============================================================

#[test]
fn test_resolution_is_idempotent() {
    let loader = builder(&ScriptedFetcher::new()).build();

    let refs = [
        "errorHandler",
        "./errorHandler.js",
        "../core/errorHandler.mjs",
        "errorHandler.js?v=2",
        "./lib/errorHandler#dup",
        "core/errorHandler",
    ];
    for reference in refs {
        let id = loader.resolve(reference);
        assert_eq!(id.as_str(), "core/errorHandler", "reference {}", reference);
        assert_eq!(loader.resolve(id.as_str()), id);
    }

    assert_eq!(loader.resolve("app").as_str(), "core/app");
    assert_eq!(
        loader.resolve("https://cdn.example.com/ui.js").as_str(),
        "https://cdn.example.com/ui.js"
    );
    // Unknown names come back unchanged
    assert_eq!(loader.resolve("widgets").as_str(), "widgets");
}

// ============================================================
// In-flight de-duplication
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_loads_share_one_fetch() {
    let fetcher = ScriptedFetcher::new();
    fetcher.delay("core/uiRegistry", Duration::from_millis(50));
    let loader = builder(&fetcher).build();

    let options = LoadOptions::new();
    let results = join_all((0..5).map(|i| {
        let reference = if i % 2 == 0 { "uiRegistry" } else { "./uiRegistry.js" };
        loader.load(reference, &options)
    }))
    .await;

    assert_eq!(fetcher.calls_for("core/uiRegistry"), 1);
    let surfaces: Vec<_> = results
        .into_iter()
        .map(|r| r.expect("load succeeds").surface().expect("ready surface"))
        .collect();
    assert!(surfaces.iter().all(|s| Arc::ptr_eq(s, &surfaces[0])));
    assert_eq!(loader.state("uiRegistry"), ModuleState::Loaded);
}

#[tokio::test(start_paused = true)]
async fn test_cached_module_is_not_refetched() {
    let fetcher = ScriptedFetcher::new();
    let loader = builder(&fetcher).build();

    loader.load("stateManager", &LoadOptions::new()).await.unwrap();
    loader.load("stateManager", &LoadOptions::new()).await.unwrap();
    assert_eq!(fetcher.calls_for("core/stateManager"), 1);

    loader
        .load("stateManager", &LoadOptions::new().skip_cache())
        .await
        .unwrap();
    assert_eq!(fetcher.calls_for("core/stateManager"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_refresh_keeps_loaded_module() {
    let fetcher = ScriptedFetcher::new();
    let loader = builder(&fetcher).build();

    let first = loader.load("x", &LoadOptions::new()).await.unwrap();
    fetcher.fail_always("x");

    let refreshed = loader
        .load("x", &LoadOptions::new().skip_cache())
        .await
        .unwrap();
    assert!(!refreshed.is_fallback());
    assert!(Arc::ptr_eq(&first.surface().unwrap(), &refreshed.surface().unwrap()));
    assert_eq!(fetcher.calls_for("x"), 4);

    assert_eq!(loader.state("x"), ModuleState::Loaded);
    assert!(loader.health().is_ok());
    let later = loader.load("x", &LoadOptions::new()).await.unwrap();
    assert!(!later.is_fallback());
    assert_eq!(fetcher.calls_for("x"), 4);
    assert_eq!(loader.completion_order(), vec![CanonicalId::from("x")]);
}

// ============================================================
// Cycles
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_cycle_resolves_through_proxy_and_replays() {
    let fetcher = ScriptedFetcher::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let replies: Arc<Mutex<Vec<PendingReply>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let log = log.clone();
        fetcher.surface("a", move |id| logging_surface(id, log.clone()));
    }
    {
        let replies = replies.clone();
        fetcher.on_fetch("b", move |request| {
            let a = &request.dependencies["a"];
            assert!(a.is_deferred());
            for word in ["first", "second"] {
                match a.call("push", vec![Value::from(word)]) {
                    Ok(Dispatch::Recorded(reply)) => replies.lock().push(reply),
                    other => panic!("expected a recorded call, got {:?}", other.map(|_| ())),
                }
            }
        });
    }
    fetcher.delay("a", Duration::from_millis(10));
    fetcher.delay("b", Duration::from_millis(10));

    let table = DependencyTable::new()
        .with_dependencies("a", ["b"])
        .with_dependencies("b", ["a"]);
    let loader = builder(&fetcher).with_dependencies(table).build();

    let a = tokio::time::timeout(Duration::from_secs(30), loader.load("a", &LoadOptions::new()))
        .await
        .expect("no deadlock")
        .expect("a loads");
    assert!(!a.is_deferred());
    assert_eq!(loader.state("a"), ModuleState::Loaded);
    assert_eq!(loader.state("b"), ModuleState::Loaded);
    assert_eq!(fetcher.calls_for("a"), 1);
    assert_eq!(fetcher.calls_for("b"), 1);

    // Recorded calls replayed in order against the real module
    assert_eq!(*log.lock(), vec!["first".to_string(), "second".to_string()]);
    let replies: Vec<PendingReply> = replies.lock().drain(..).collect();
    let mut values = Vec::new();
    for reply in replies {
        values.push(reply.wait().await.expect("replayed"));
    }
    assert_eq!(values, vec![Value::Int(1), Value::Int(2)]);

    // Later lookups see the real module, not the proxy
    let again = loader.load("a", &LoadOptions::new()).await.unwrap();
    assert!(!again.is_deferred());
    assert!(Arc::ptr_eq(&again.surface().unwrap(), &a.surface().unwrap()));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_cycle_does_not_deadlock() {
    let fetcher = ScriptedFetcher::new();
    fetcher.delay("a", Duration::from_millis(10));
    fetcher.delay("b", Duration::from_millis(10));

    let table = DependencyTable::new()
        .with_dependencies("a", ["b"])
        .with_dependencies("b", ["a"]);
    let loader = builder(&fetcher).with_dependencies(table).build();

    let options = LoadOptions::new();
    let (a, b) = tokio::time::timeout(
        Duration::from_secs(30),
        futures::future::join(loader.load("a", &options), loader.load("b", &options)),
    )
    .await
    .expect("no deadlock");

    assert!(a.unwrap().surface().is_some());
    assert!(b.unwrap().surface().is_some());
    assert_eq!(fetcher.calls_for("a"), 1);
    assert_eq!(fetcher.calls_for("b"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_proxy_for_failed_cycle_member_binds_to_fallback() {
    let fetcher = ScriptedFetcher::new();
    let replies: Arc<Mutex<Vec<PendingReply>>> = Arc::new(Mutex::new(Vec::new()));
    fetcher.fail_always("a");
    {
        let replies = replies.clone();
        fetcher.on_fetch("b", move |request| {
            if let Ok(Dispatch::Recorded(reply)) =
                request.dependencies["a"].call("initialize", Vec::new())
            {
                replies.lock().push(reply);
            }
        });
    }

    let table = DependencyTable::new()
        .with_dependencies("a", ["b"])
        .with_dependencies("b", ["a"]);
    let loader = builder(&fetcher).with_dependencies(table).build();

    let a = loader.load("a", &LoadOptions::new()).await.unwrap();
    assert!(a.is_fallback());
    assert_eq!(loader.state("a"), ModuleState::Fallback);

    let reply = replies.lock().pop().expect("call recorded");
    let value = reply.wait().await.expect("replayed against fallback");
    assert!(value.is_awaitable());
}

// ============================================================
// Retries and timeouts
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_retry_bound_on_permanent_failure() {
    let fetcher = ScriptedFetcher::new();
    fetcher.fail_always("x");
    let loader = builder(&fetcher).build();

    let x = loader
        .load("x", &LoadOptions::new().with_retries(3))
        .await
        .expect("non-required load never fails");

    assert_eq!(fetcher.calls_for("x"), 3);
    assert!(x.is_fallback());
    let record = loader.record("x").unwrap();
    assert_eq!(record.attempts(), 3);
    assert!(matches!(
        record.last_error(),
        Some(LoadError::RetriesExhausted { attempts: 3, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_required_load_surfaces_retries_exhausted() {
    let fetcher = ScriptedFetcher::new();
    fetcher.fail_always("core/errorHandler");
    let loader = builder(&fetcher).build();

    let err = loader
        .load("errorHandler", &LoadOptions::new().required())
        .await
        .unwrap_err();
    match err {
        LoadError::RetriesExhausted { id, attempts, last } => {
            assert_eq!(id.as_str(), "core/errorHandler");
            assert_eq!(attempts, 3);
            assert!(matches!(*last, LoadError::FetchFailed { attempt: 3, .. }));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(loader.state("errorHandler"), ModuleState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_unresolved_required_reference_is_an_error() {
    let fetcher = ScriptedFetcher::new();
    fetcher.fail_always("mystery");
    let loader = builder(&fetcher).build();

    let err = loader
        .load("mystery", &LoadOptions::new().required().with_retries(1))
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::RetriesExhausted { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_flaky_module_loads_within_budget() {
    let fetcher = ScriptedFetcher::new();
    fetcher.fail_times("flaky", 2);
    let loader = builder(&fetcher).build();

    let flaky = loader.load("flaky", &LoadOptions::new().required()).await.unwrap();
    assert!(!flaky.is_fallback());
    assert_eq!(fetcher.calls_for("flaky"), 3);
    assert_eq!(loader.record("flaky").unwrap().attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_module_is_not_retried_on_fresh_request() {
    let fetcher = ScriptedFetcher::new();
    fetcher.fail_always("x");
    let loader = builder(&fetcher).build();

    let first = loader.load("x", &LoadOptions::new()).await.unwrap();
    let second = loader
        .load("x", &LoadOptions::new().skip_cache())
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&first.surface().unwrap(), &second.surface().unwrap()));

    let err = loader
        .load("x", &LoadOptions::new().required())
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::RetriesExhausted { .. }));
    assert_eq!(fetcher.calls_for("x"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_counts_as_failed_attempt() {
    let fetcher = ScriptedFetcher::new();
    fetcher.hang("slow");
    let loader = builder(&fetcher).build();

    let options = LoadOptions::new()
        .with_timeout(Duration::from_millis(50))
        .with_retries(2)
        .required();
    let err = loader.load("slow", &options).await.unwrap_err();
    match err {
        LoadError::RetriesExhausted { last, .. } => {
            assert!(matches!(*last, LoadError::FetchTimeout { attempt: 2, .. }));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(fetcher.calls_for("slow"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_late_completion_does_not_overwrite_timed_out_record() {
    let fetcher = ScriptedFetcher::new();
    fetcher.delay("slow", Duration::from_millis(500));
    let loader = builder(&fetcher).build();

    let options = LoadOptions::new()
        .with_timeout(Duration::from_millis(50))
        .with_retries(1);
    let slow = loader.load("slow", &options).await.unwrap();
    assert!(slow.is_fallback());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(loader.state("slow"), ModuleState::Fallback);
    assert_eq!(loader.report().loaded_count, 0);
    // The abandoned attempt never finished
    assert_eq!(fetcher.position("end slow"), None);
}

#[tokio::test(start_paused = true)]
async fn test_completion_after_clear_is_ignored() {
    let fetcher = ScriptedFetcher::new();
    fetcher.delay("x", Duration::from_millis(100));
    let loader = builder(&fetcher).build();

    let options = LoadOptions::new();
    let (result, purged) = tokio::join!(loader.load("x", &options), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        loader.clear_failed(Some(&["x"]))
    });

    assert_eq!(purged, 1);
    // Callers already waiting still receive the module
    assert!(result.unwrap().surface().is_some());
    // The registry does not record it
    assert_eq!(loader.state("x"), ModuleState::Unseen);
    assert_eq!(loader.report().loaded_count, 0);
}

// ============================================================
// Fallbacks
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_ui_fallback_scenario() {
    let fetcher = ScriptedFetcher::new();
    fetcher.fail_always("ui");
    let mut expected = std::collections::BTreeMap::new();
    expected.insert(
        CanonicalId::from("ui"),
        ExpectedExports::new(["render", "show"]).with_async(["show"]),
    );
    let loader = builder(&fetcher)
        .with_fallbacks(FallbackSynthesizer::new(expected))
        .build();

    let ui = loader.load("ui", &LoadOptions::new()).await.unwrap();
    assert!(ui.is_fallback());

    let surface = ui.surface().unwrap();
    assert_eq!(surface.call("render", &[Value::from("toast")]), Ok(Value::Null));

    let shown = surface.call("show", &[]).unwrap();
    assert!(shown.is_awaitable());
    assert_eq!(shown.settle().await, Value::Null);

    let init = surface.call("initialize", &[]).unwrap();
    assert!(init.is_awaitable());

    // Undeclared members are stubbed too
    assert_eq!(surface.call("openModal", &[]), Ok(Value::Null));

    let report = loader.report();
    assert!(report.fallback_ids.contains(&"ui".to_string()));
    assert!(report.failed_ids.contains(&"ui".to_string()));
    assert_eq!(loader.health().status, HealthStatus::Warning);
}

#[tokio::test(start_paused = true)]
async fn test_real_surface_rejects_unknown_member() {
    let fetcher = ScriptedFetcher::new();
    let loader = builder(&fetcher).build();
    let ui = loader.load("ui", &LoadOptions::new()).await.unwrap();
    let surface = ui.surface().unwrap();
    assert_eq!(surface.call("name", &[]), Ok(Value::from("ui")));
    assert!(matches!(
        surface.call("missing", &[]),
        Err(CallError::UnknownMember { .. })
    ));
}

// ============================================================
// Dependencies
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_dependencies_load_before_dependent() {
    let fetcher = ScriptedFetcher::new();
    fetcher.delay("core/stateManager", Duration::from_millis(20));
    {
        fetcher.on_fetch("core/app", |request| {
            let state = &request.dependencies["core/stateManager"];
            assert!(!state.is_deferred());
            assert!(!state.is_fallback());
        });
    }
    let table = DependencyTable::new().with_dependencies("core/app", ["core/stateManager"]);
    let loader = builder(&fetcher).with_dependencies(table).build();

    loader.load("app", &LoadOptions::new()).await.unwrap();
    let end_dep = fetcher.position("end core/stateManager").unwrap();
    let start_app = fetcher.position("start core/app").unwrap();
    assert!(end_dep < start_app);
}

#[tokio::test(start_paused = true)]
async fn test_missing_dependency_is_tolerated() {
    let fetcher = ScriptedFetcher::new();
    fetcher.fail_always("core/errorHandler");
    fetcher.on_fetch("core/app", |request| {
        assert!(request.dependencies["core/errorHandler"].is_fallback());
    });
    let table = DependencyTable::new().with_dependencies("core/app", ["core/errorHandler"]);
    let loader = builder(&fetcher).with_dependencies(table).build();

    let app = loader.load("app", &LoadOptions::new().required()).await.unwrap();
    assert!(!app.is_fallback());
    assert_eq!(fetcher.calls_for("core/app"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_critical_dependency_failure_aborts_dependent() {
    let fetcher = ScriptedFetcher::new();
    fetcher.fail_always("core/errorHandler");
    let table = DependencyTable::new().with_dependencies("core/app", ["core/errorHandler"]);
    let loader = builder(&fetcher).with_dependencies(table).build();

    let options = LoadOptions::new()
        .required()
        .with_critical_dependency("core/errorHandler");
    let err = loader.load("app", &options).await.unwrap_err();
    match &err {
        LoadError::CriticalDependencyFailed { id, dependency, .. } => {
            assert_eq!(id.as_str(), "core/app");
            assert_eq!(dependency.as_str(), "core/errorHandler");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(fetcher.calls_for("core/app"), 0);
    assert_eq!(fetcher.calls_for("core/errorHandler"), 3);
    assert_eq!(loader.record("app").unwrap().attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_load_many_runs_critical_modules_first() {
    let fetcher = ScriptedFetcher::new();
    fetcher.delay("core/errorHandler", Duration::from_millis(100));
    let table = DependencyTable::new().with_critical(["core/errorHandler"]);
    let loader = builder(&fetcher).with_dependencies(table).build();

    let modules = loader
        .load_many(&["core/uiRegistry", "core/errorHandler"], &LoadOptions::new())
        .await
        .unwrap();
    assert_eq!(modules.len(), 2);
    assert!(modules.contains_key("core/uiRegistry"));

    let handler_done = fetcher.position("end core/errorHandler").unwrap();
    let registry_start = fetcher.position("start core/uiRegistry").unwrap();
    assert!(handler_done < registry_start);
    assert_eq!(loader.completion_order()[0].as_str(), "core/errorHandler");
}

#[tokio::test(start_paused = true)]
async fn test_load_many_respects_concurrency_limit() {
    let fetcher = ScriptedFetcher::new();
    let names = ["m1", "m2", "m3", "m4", "m5"];
    for name in names {
        fetcher.delay(name, Duration::from_millis(10));
    }
    let loader = builder(&fetcher).with_max_concurrency(2).build();

    let modules = loader.load_many(&names, &LoadOptions::new()).await.unwrap();
    assert_eq!(modules.len(), 5);
    assert_eq!(fetcher.peak_concurrency(), 2);

    // Batches run in sequence
    let m2_end = fetcher.position("end m2").unwrap();
    let m3_start = fetcher.position("start m3").unwrap();
    assert!(m2_end < m3_start);
}

#[tokio::test(start_paused = true)]
async fn test_load_many_keys_by_reference() {
    let fetcher = ScriptedFetcher::new();
    let loader = builder(&fetcher).build();

    let modules = loader
        .load_many(&["./uiRegistry.js", "uiRegistry"], &LoadOptions::new())
        .await
        .unwrap();
    assert_eq!(fetcher.calls_for("core/uiRegistry"), 1);
    assert_eq!(modules["./uiRegistry.js"].id().as_str(), "core/uiRegistry");
    assert_eq!(modules["uiRegistry"].id().as_str(), "core/uiRegistry");
}

// ============================================================
// Clearing, recovery, health
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_clear_failed_then_reload() {
    let fetcher = ScriptedFetcher::new();
    fetcher.fail_times("x", 3);
    let loader = builder(&fetcher).build();

    loader.load("x", &LoadOptions::new()).await.unwrap();
    assert!(loader.report().failed_ids.contains(&"x".to_string()));

    assert_eq!(loader.clear_failed(Some(&["x"])), 1);
    let x = loader.load("x", &LoadOptions::new()).await.unwrap();
    assert!(!x.is_fallback());
    assert_eq!(loader.state("x"), ModuleState::Loaded);

    let report = loader.report();
    assert!(!report.failed_ids.contains(&"x".to_string()));
    assert!(report.fallback_ids.is_empty());
    assert!(loader.health().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_clear_everything() {
    let fetcher = ScriptedFetcher::new();
    fetcher.fail_always("bad");
    let loader = builder(&fetcher).build();

    loader.load("good", &LoadOptions::new()).await.unwrap();
    loader.load("bad", &LoadOptions::new()).await.unwrap();
    assert_eq!(loader.clear_failed(None), 2);

    let report = loader.report();
    assert_eq!(report.loaded_count, 0);
    assert!(report.failed_ids.is_empty());
    assert!(report.fallback_ids.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_recover_reloads_failed_critical_modules() {
    let fetcher = ScriptedFetcher::new();
    fetcher.fail_times("core/errorHandler", 3);
    let table = DependencyTable::new().with_critical(["core/errorHandler"]);
    let loader = builder(&fetcher).with_dependencies(table).build();

    loader.load("errorHandler", &LoadOptions::new()).await.unwrap();
    assert_eq!(loader.health().status, HealthStatus::Critical);

    let recovered = loader.recover().await;
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].as_str(), "core/errorHandler");
    assert_eq!(loader.state("errorHandler"), ModuleState::Loaded);
    assert!(loader.health().is_ok());
    assert_eq!(fetcher.calls_for("core/errorHandler"), 4);
}

#[tokio::test(start_paused = true)]
async fn test_recover_with_unusable_timeout_factor() {
    let fetcher = ScriptedFetcher::new();
    fetcher.fail_times("core/errorHandler", 3);
    let table = DependencyTable::new().with_critical(["core/errorHandler"]);
    let loader = ModuleLoader::builder(fetcher.clone())
        .with_resolver(shell_resolver())
        .with_dependencies(table)
        .with_config(LoaderConfig {
            policy: fast_policy(),
            max_concurrency: 4,
            recovery: RecoveryPolicy {
                timeout_factor: -1.0,
                attempts: 2,
            },
        })
        .build();

    loader.load("errorHandler", &LoadOptions::new()).await.unwrap();
    assert_eq!(loader.health().status, HealthStatus::Critical);

    let recovered = loader.recover().await;
    assert_eq!(recovered, vec![CanonicalId::from("core/errorHandler")]);
    assert!(loader.health().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_average_load_time() {
    let fetcher = ScriptedFetcher::new();
    fetcher.delay("a", Duration::from_millis(10));
    fetcher.delay("b", Duration::from_millis(30));
    let loader = builder(&fetcher).build();

    loader.load("a", &LoadOptions::new()).await.unwrap();
    loader.load("b", &LoadOptions::new()).await.unwrap();

    let report = loader.report();
    assert_eq!(report.loaded_count, 2);
    assert!(report.avg_load_time_ms >= 20.0);
}

#[tokio::test(start_paused = true)]
async fn test_events_reach_subscribers() {
    let fetcher = ScriptedFetcher::new();
    fetcher.fail_always("bad");
    let bus = Arc::new(EventBus::new(16));
    let mut rx = bus.subscribe();
    let loader = builder(&fetcher).with_observer(bus.clone()).build();

    loader.load("good", &LoadOptions::new()).await.unwrap();
    loader.load("bad", &LoadOptions::new()).await.unwrap();

    assert!(matches!(rx.try_recv(), Ok(LoaderEvent::Loaded { id, .. }) if id.as_str() == "good"));
    assert!(matches!(rx.try_recv(), Ok(LoaderEvent::Failed { id, .. }) if id.as_str() == "bad"));
    assert!(matches!(
        rx.try_recv(),
        Ok(LoaderEvent::FallbackInstalled { id }) if id.as_str() == "bad"
    ));
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_loader_works_with_echo_surface_builder() {
    let fetcher = ScriptedFetcher::new();
    fetcher.surface("core/uiRegistry", |id| {
        echo_surface(id).with_value("version", Value::Int(2))
    });
    let loader = builder(&fetcher).build();

    let ui = loader.load("uiRegistry", &LoadOptions::new()).await.unwrap();
    let surface = ui.surface().unwrap();
    assert_eq!(surface.value("version"), Some(&Value::Int(2)));
    assert_eq!(
        ui.call("name", Vec::new()).unwrap().into_value().await,
        Ok(Value::from("core/uiRegistry"))
    );
}

//! Module Loading Infrastructure
//!
//! Core types for loading, caching, and supervising runtime modules:
//! - `CanonicalId` / `PathResolver` - reference normalization
//! - `ModuleRegistry` - cache, in-flight loads, Failed set, wait-for graph
//! - `DeferredProxy` / `ModuleRef` - deferred binding for dependency cycles
//! - `DependencyTable` - declared prerequisites and the critical order
//! - `RetryPolicy` - per-attempt timeout and bounded attempts
//! - `FallbackSynthesizer` - inert substitutes for modules that failed
//! - `LoadReport` / `HealthReport` - diagnostics
//! - `ModuleLoader` - the public loading contract
//! - `ShellManifest` - `modshell.toml` parsing

mod cache;
mod deps;
mod engine;
mod error;
mod events;
mod fallback;
mod fetch;
mod health;
mod manifest;
mod path;
mod proxy;
mod record;
mod retry;
mod value;

pub use cache::{Commit, Committed, InFlight, LoadOutcome, ModuleRegistry, Reservation};
pub use deps::{DependencyTable, LoadPlan};
pub use engine::{LoadOptions, LoaderBuilder, LoaderConfig, ModuleLoader, RecoveryPolicy};
pub use error::{LoadError, LoadResult};
pub use events::{EventBus, LoaderEvent, LoaderObserver};
pub use fallback::{synthesize, ExpectedExports, FallbackSynthesizer, INITIALIZE};
pub use fetch::{shared, CatalogEntry, CatalogFetcher, FetchFailure, FetchRequest, FnFetcher, ModuleFetcher};
pub use health::{HealthReport, HealthStatus, LoadReport};
pub use manifest::{ConfigError, ShellManifest, MANIFEST_FILE};
pub use path::{is_absolute, strip_disambiguation, CanonicalId, PathResolver, Resolution, ResolutionRule};
pub use proxy::{DeferredProxy, Dispatch, ModuleRef, PendingReply, ReplaySummary};
pub use record::{ModuleRecord, ModuleState};
pub use retry::{Attempted, RetryPolicy, DEFAULT_ATTEMPTS, DEFAULT_RETRY_DELAY, DEFAULT_TIMEOUT};
pub use value::{CallError, Export, MemberFn, ModuleSurface, StubFactory, SurfaceKind, Value};

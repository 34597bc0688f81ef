//! modshell - Runtime Module Loader
//!
//! Loads independently deployed modules at runtime, wires their declared
//! dependencies, and degrades gracefully when a module cannot be loaded.
//!
//! # Architecture
//!
//! Every request for a module goes through one `ModuleLoader`:
//!
//! 1. **Resolution** (`PathResolver`)
//!    - Maps relative paths, bare names, and override aliases to one
//!      canonical id
//!    - Strips `?`/`#` disambiguation suffixes first
//!
//! 2. **Registry** (`ModuleRegistry`)
//!    - At most one load in flight per id; later callers share it
//!    - Failed ids stay failed until explicitly cleared
//!
//! 3. **Cycle breaking** (`DeferredProxy`)
//!    - A request that would wait on itself receives a proxy that records
//!      calls and replays them once the real module is bound
//!
//! 4. **Dependencies** (`DependencyTable`)
//!    - Critical modules load sequentially in a fixed order, the rest in
//!      bounded concurrent batches
//!
//! 5. **Retries and fallbacks** (`RetryPolicy`, `FallbackSynthesizer`)
//!    - Each attempt races a timeout; exhausted modules are replaced by an
//!      inert surface unless the caller required the real one
//!
//! # Example
//!
//! ```rust
//! use futures::FutureExt;
//! use modshell::loader::*;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let fetcher = FnFetcher::new(|req: FetchRequest| {
//!     async move {
//!         Err::<ModuleSurface, _>(FetchFailure::new(format!("{} is offline", req.id)))
//!     }
//!     .boxed()
//! });
//!
//! let loader = ModuleLoader::builder(shared(fetcher))
//!     .with_policy(RetryPolicy::default().with_attempts(1))
//!     .build();
//!
//! // Not required: a fallback surface comes back instead of an error
//! let ui = loader.load("ui", &LoadOptions::new()).await.unwrap();
//! assert!(ui.is_fallback());
//! assert_eq!(loader.report().fallback_ids, vec!["ui".to_string()]);
//! # });
//! ```

pub mod loader;
pub mod logging;

pub use loader::{
    CanonicalId, HealthReport, HealthStatus, LoadError, LoadOptions, LoadReport, LoadResult,
    ModuleLoader, ModuleRef, ModuleSurface, ShellManifest, Value,
};

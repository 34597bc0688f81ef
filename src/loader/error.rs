//! Loader error kinds.

use std::time::Duration;

use thiserror::Error;

use super::path::CanonicalId;

/// Result type for module loading operations.
pub type LoadResult<T> = Result<T, LoadError>;

/// Errors produced while providing a module.
///
/// `Clone` because one failure is handed to every caller joined on the same
/// in-flight load.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The reference matched no resolution rule. Non-fatal: the loader logs it
    /// and proceeds with the best-effort id.
    #[error("reference '{reference}' matched no resolution rule, using '{id}'")]
    ResolutionAmbiguous { reference: String, id: CanonicalId },

    /// A single fetch attempt did not finish within its deadline.
    #[error("fetching '{id}' timed out after {timeout:?} (attempt {attempt})")]
    FetchTimeout {
        id: CanonicalId,
        attempt: u32,
        timeout: Duration,
    },

    /// A single fetch attempt failed.
    #[error("fetching '{id}' failed on attempt {attempt}: {reason}")]
    FetchFailed {
        id: CanonicalId,
        attempt: u32,
        reason: String,
    },

    /// A dependency the caller marked critical could not be provided.
    #[error("critical dependency '{dependency}' of '{id}' failed: {reason}")]
    CriticalDependencyFailed {
        id: CanonicalId,
        dependency: CanonicalId,
        reason: String,
    },

    /// Every attempt failed; `last` is the final attempt's error.
    #[error("'{id}' could not be loaded after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        id: CanonicalId,
        attempts: u32,
        last: Box<LoadError>,
    },
}

impl LoadError {
    /// The module the error is about.
    pub fn id(&self) -> &CanonicalId {
        match self {
            Self::ResolutionAmbiguous { id, .. }
            | Self::FetchTimeout { id, .. }
            | Self::FetchFailed { id, .. }
            | Self::CriticalDependencyFailed { id, .. }
            | Self::RetriesExhausted { id, .. } => id,
        }
    }
}

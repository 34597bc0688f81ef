//! Fallback Surface Synthesis
//!
//! When a module cannot be loaded, dependents receive a synthesized surface
//! instead. Every declared member logs the call and returns an inert value:
//! a settled empty result for members callers await, `Null` otherwise.
//! `initialize` always settles successfully, and members nobody declared are
//! stubbed on first access.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use super::path::CanonicalId;
use super::value::{MemberFn, ModuleSurface, StubFactory, Value};

/// Member that every fallback surface exposes and that always succeeds.
pub const INITIALIZE: &str = "initialize";

/// Declared export list for a module.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ExpectedExports {
    /// Member names the module is expected to export.
    #[serde(default)]
    pub members: Vec<String>,

    /// Members callers await; their stubs return a settled result.
    #[serde(default, rename = "async")]
    pub async_members: Vec<String>,
}

impl ExpectedExports {
    pub fn new<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            members: members.into_iter().map(Into::into).collect(),
            async_members: Vec::new(),
        }
    }

    pub fn with_async<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.async_members = members.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_async(&self, member: &str) -> bool {
        self.async_members.iter().any(|m| m == member)
    }
}

/// Builds fallback surfaces from the declared expected-exports table.
#[derive(Clone, Debug, Default)]
pub struct FallbackSynthesizer {
    expected: BTreeMap<CanonicalId, ExpectedExports>,
}

impl FallbackSynthesizer {
    pub fn new(expected: BTreeMap<CanonicalId, ExpectedExports>) -> Self {
        Self { expected }
    }

    /// Expected exports declared for `id`, if any.
    pub fn expected(&self, id: &CanonicalId) -> Option<&ExpectedExports> {
        self.expected.get(id)
    }

    /// Synthesize a fresh fallback for `id` from its declared exports.
    pub fn synthesize(&self, id: &CanonicalId) -> Arc<ModuleSurface> {
        match self.expected.get(id) {
            Some(expected) => synthesize(id, expected),
            None => synthesize(id, &ExpectedExports::default()),
        }
    }
}

/// Synthesize a fallback surface mirroring `expected`.
///
/// The same inputs always give the same member set; each call returns a new
/// surface with no state shared with earlier ones.
pub fn synthesize(id: &CanonicalId, expected: &ExpectedExports) -> Arc<ModuleSurface> {
    let mut names: BTreeSet<&str> = expected
        .members
        .iter()
        .chain(expected.async_members.iter())
        .map(String::as_str)
        .collect();
    names.remove(INITIALIZE);

    let mut surface = ModuleSurface::fallback(id.clone(), generic_stub_factory())
        .with_member(INITIALIZE, stub(id, INITIALIZE, true));
    for name in names {
        surface = surface.with_member(name, stub(id, name, expected.is_async(name)));
    }

    warn!(target: "modshell::fallback", %id, members = surface.member_names().count(), "Synthesized fallback surface");
    Arc::new(surface)
}

fn stub(id: &CanonicalId, member: &str, awaited: bool) -> MemberFn {
    let id = id.clone();
    let member = member.to_string();
    Arc::new(move |args: &[Value]| {
        warn!(target: "modshell::fallback", %id, member = %member, args = args.len(), "Fallback member invoked");
        Ok(if awaited {
            Value::resolved(Value::Null)
        } else {
            Value::Null
        })
    })
}

fn generic_stub_factory() -> StubFactory {
    Arc::new(|id, member| stub(id, member, false))
}

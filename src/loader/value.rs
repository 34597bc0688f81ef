//! Module Export Surfaces
//!
//! A `ModuleSurface` is what a fetch produces: a named set of exports, each
//! either a plain value or a callable member. Fallback surfaces additionally
//! answer calls to members they were never told about.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use super::path::CanonicalId;

/// A value exchanged with module members.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// An already-settled asynchronous result.
    ///
    /// Awaiting it (see [`Value::settle`]) yields the inner value.
    Resolved(Box<Value>),
}

impl Value {
    /// Wrap a value as a settled asynchronous result.
    pub fn resolved(inner: Value) -> Self {
        Value::Resolved(Box::new(inner))
    }

    /// Whether callers may `settle` this value as a completed async result.
    pub fn is_awaitable(&self) -> bool {
        matches!(self, Value::Resolved(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Await the value: unwraps `Resolved`, passes anything else through.
    pub async fn settle(self) -> Value {
        match self {
            Value::Resolved(inner) => *inner,
            other => other,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Errors raised when dispatching a call to a module member.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("module '{module}' has no member '{member}'")]
    UnknownMember { module: CanonicalId, member: String },

    #[error("member '{member}' of '{module}' is not callable")]
    NotCallable { module: CanonicalId, member: String },

    #[error("call to '{module}.{member}' failed: {reason}")]
    Failed {
        module: CanonicalId,
        member: String,
        reason: String,
    },

    /// A recorded call whose proxy was dropped before it was ever bound.
    #[error("deferred call to '{module}.{member}' was never replayed")]
    NeverReplayed { module: CanonicalId, member: String },
}

/// A callable module member.
pub type MemberFn = Arc<dyn Fn(&[Value]) -> Result<Value, CallError> + Send + Sync>;

/// Produces a stub for a member name a surface does not declare.
pub type StubFactory = Arc<dyn Fn(&CanonicalId, &str) -> MemberFn + Send + Sync>;

/// One exported member.
#[derive(Clone)]
pub enum Export {
    Value(Value),
    Function(MemberFn),
}

impl fmt::Debug for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Export::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Export::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// Where a surface came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SurfaceKind {
    /// Produced by the fetcher.
    Real,
    /// Synthesized after the module could not be loaded.
    Fallback,
}

/// The exported surface of a module.
pub struct ModuleSurface {
    id: CanonicalId,
    kind: SurfaceKind,
    exports: BTreeMap<String, Export>,
    stub_factory: Option<StubFactory>,
}

impl ModuleSurface {
    /// Create an empty real surface.
    pub fn new(id: impl Into<CanonicalId>) -> Self {
        Self {
            id: id.into(),
            kind: SurfaceKind::Real,
            exports: BTreeMap::new(),
            stub_factory: None,
        }
    }

    /// Create an empty fallback surface that stubs unknown members on access.
    pub fn fallback(id: impl Into<CanonicalId>, stub_factory: StubFactory) -> Self {
        Self {
            id: id.into(),
            kind: SurfaceKind::Fallback,
            exports: BTreeMap::new(),
            stub_factory: Some(stub_factory),
        }
    }

    /// Add a plain value export.
    pub fn with_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.exports.insert(name.into(), Export::Value(value));
        self
    }

    /// Add a callable export.
    pub fn with_function<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, CallError> + Send + Sync + 'static,
    {
        self.exports.insert(name.into(), Export::Function(Arc::new(f)));
        self
    }

    /// Add an already-shared callable export.
    pub fn with_member(mut self, name: impl Into<String>, f: MemberFn) -> Self {
        self.exports.insert(name.into(), Export::Function(f));
        self
    }

    pub fn id(&self) -> &CanonicalId {
        &self.id
    }

    pub fn kind(&self) -> SurfaceKind {
        self.kind
    }

    pub fn is_fallback(&self) -> bool {
        self.kind == SurfaceKind::Fallback
    }

    /// Names of the declared exports, in sorted order.
    pub fn member_names(&self) -> impl Iterator<Item = &str> {
        self.exports.keys().map(|k| k.as_str())
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.exports.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Export> {
        self.exports.get(name)
    }

    /// Get a plain value export.
    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.exports.get(name) {
            Some(Export::Value(v)) => Some(v),
            _ => None,
        }
    }

    /// Call a member.
    ///
    /// Fallback surfaces answer unknown members through their stub factory;
    /// real surfaces report `UnknownMember`.
    pub fn call(&self, member: &str, args: &[Value]) -> Result<Value, CallError> {
        match self.exports.get(member) {
            Some(Export::Function(f)) => f(args),
            Some(Export::Value(_)) => Err(CallError::NotCallable {
                module: self.id.clone(),
                member: member.to_string(),
            }),
            None => match &self.stub_factory {
                Some(factory) => factory(&self.id, member)(args),
                None => Err(CallError::UnknownMember {
                    module: self.id.clone(),
                    member: member.to_string(),
                }),
            },
        }
    }
}

impl fmt::Debug for ModuleSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleSurface")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("exports", &self.exports.keys().collect::<Vec<_>>())
            .finish()
    }
}

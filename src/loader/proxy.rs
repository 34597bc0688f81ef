//! Deferred-Binding Proxies
//!
//! When a load request re-enters a module whose own load is still in progress
//! higher up the chain, the loader hands out a `DeferredProxy` instead of
//! waiting on itself. Calls made against the proxy are recorded in order and
//! replayed, in one pass, once the real surface is bound.
//!
//! Callers see either form through `ModuleRef` and dispatch with an explicit
//! match; a recorded call yields a `PendingReply` that settles after replay.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::path::CanonicalId;
use super::value::{CallError, ModuleSurface, Value};

/// A call recorded while the proxy was unbound.
struct PendingCall {
    member: String,
    args: Vec<Value>,
    reply: oneshot::Sender<Result<Value, CallError>>,
}

enum ProxyState {
    Unbound { calls: Vec<PendingCall> },
    Bound(Arc<ModuleSurface>),
}

/// Outcome of binding a proxy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Recorded calls that were replayed.
    pub replayed: usize,
    /// Replayed calls that returned an error (logged, not propagated).
    pub failed: usize,
}

/// Stand-in for a module whose real surface is not known yet.
///
/// Cloning shares the same underlying call log.
#[derive(Clone)]
pub struct DeferredProxy {
    id: CanonicalId,
    state: Arc<Mutex<ProxyState>>,
}

impl DeferredProxy {
    pub fn new(id: CanonicalId) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(ProxyState::Unbound { calls: Vec::new() })),
        }
    }

    pub fn id(&self) -> &CanonicalId {
        &self.id
    }

    pub fn is_bound(&self) -> bool {
        matches!(*self.state.lock(), ProxyState::Bound(_))
    }

    /// Number of calls waiting for replay.
    pub fn pending_len(&self) -> usize {
        match &*self.state.lock() {
            ProxyState::Unbound { calls } => calls.len(),
            ProxyState::Bound(_) => 0,
        }
    }

    /// The bound surface, if any.
    pub fn bound(&self) -> Option<Arc<ModuleSurface>> {
        match &*self.state.lock() {
            ProxyState::Bound(surface) => Some(surface.clone()),
            ProxyState::Unbound { .. } => None,
        }
    }

    /// Call a member: recorded while unbound, forwarded once bound.
    pub fn call(&self, member: &str, args: Vec<Value>) -> Result<Dispatch, CallError> {
        let surface = {
            let mut state = self.state.lock();
            match &mut *state {
                ProxyState::Unbound { calls } => {
                    let (reply, rx) = oneshot::channel();
                    calls.push(PendingCall {
                        member: member.to_string(),
                        args,
                        reply,
                    });
                    debug!(target: "modshell::proxy", id = %self.id, member, pending = calls.len(), "Recorded deferred call");
                    return Ok(Dispatch::Recorded(PendingReply {
                        module: self.id.clone(),
                        member: member.to_string(),
                        rx,
                    }));
                }
                ProxyState::Bound(surface) => surface.clone(),
            }
        };
        surface.call(member, &args).map(Dispatch::Returned)
    }

    /// Bind the real surface and replay every recorded call in insertion order.
    ///
    /// A failing replay is logged and reported to its own caller only; the
    /// remaining calls still run. Binding an already-bound proxy is a no-op.
    pub fn bind(&self, surface: Arc<ModuleSurface>) -> ReplaySummary {
        let calls = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, ProxyState::Bound(surface.clone())) {
                ProxyState::Unbound { calls } => calls,
                ProxyState::Bound(previous) => {
                    *state = ProxyState::Bound(previous);
                    debug!(target: "modshell::proxy", id = %self.id, "Proxy already bound");
                    return ReplaySummary::default();
                }
            }
        };

        let mut summary = ReplaySummary::default();
        for call in calls {
            let result = surface.call(&call.member, &call.args);
            summary.replayed += 1;
            if let Err(e) = &result {
                summary.failed += 1;
                warn!(target: "modshell::proxy", id = %self.id, member = %call.member, error = %e, "Replayed call failed");
            }
            // The caller may have stopped waiting for the reply
            let _ = call.reply.send(result);
        }
        debug!(target: "modshell::proxy", id = %self.id, replayed = summary.replayed, failed = summary.failed, "Proxy bound");
        summary
    }
}

impl fmt::Debug for DeferredProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredProxy")
            .field("id", &self.id)
            .field("bound", &self.is_bound())
            .field("pending", &self.pending_len())
            .finish()
    }
}

/// The reply to a call recorded on an unbound proxy.
#[derive(Debug)]
pub struct PendingReply {
    module: CanonicalId,
    member: String,
    rx: oneshot::Receiver<Result<Value, CallError>>,
}

impl PendingReply {
    /// Wait for the replay result.
    pub async fn wait(self) -> Result<Value, CallError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(CallError::NeverReplayed {
                module: self.module,
                member: self.member,
            }),
        }
    }
}

/// Result of dispatching a call through a `ModuleRef`.
#[derive(Debug)]
pub enum Dispatch {
    /// The member ran immediately.
    Returned(Value),
    /// The call was recorded on an unbound proxy.
    Recorded(PendingReply),
}

impl Dispatch {
    /// Get the member's result, waiting for replay if the call was recorded.
    pub async fn into_value(self) -> Result<Value, CallError> {
        match self {
            Dispatch::Returned(v) => Ok(v),
            Dispatch::Recorded(reply) => reply.wait().await,
        }
    }
}

/// A provided module: either the real surface or a deferred proxy for it.
#[derive(Clone, Debug)]
pub enum ModuleRef {
    Ready(Arc<ModuleSurface>),
    Deferred(DeferredProxy),
}

impl ModuleRef {
    pub fn id(&self) -> &CanonicalId {
        match self {
            ModuleRef::Ready(surface) => surface.id(),
            ModuleRef::Deferred(proxy) => proxy.id(),
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, ModuleRef::Deferred(_))
    }

    /// Whether the underlying surface is a synthesized fallback.
    pub fn is_fallback(&self) -> bool {
        self.surface().is_some_and(|s| s.is_fallback())
    }

    /// The real surface, directly or through a bound proxy.
    pub fn surface(&self) -> Option<Arc<ModuleSurface>> {
        match self {
            ModuleRef::Ready(surface) => Some(surface.clone()),
            ModuleRef::Deferred(proxy) => proxy.bound(),
        }
    }

    /// Call a member on whichever form this is.
    pub fn call(&self, member: &str, args: Vec<Value>) -> Result<Dispatch, CallError> {
        match self {
            ModuleRef::Ready(surface) => surface.call(member, &args).map(Dispatch::Returned),
            ModuleRef::Deferred(proxy) => proxy.call(member, args),
        }
    }
}

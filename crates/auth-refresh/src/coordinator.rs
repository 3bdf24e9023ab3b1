//! Single-flight refresh coordination
//!
//! The coordinator owns the only shared mutable state of the refresh
//! machinery: whether a refresh is in flight, and if so which hold
//! interceptors are queueing requests behind it. Both live in one tagged
//! union so "a hold interceptor is installed" and "a refresh is in flight"
//! cannot disagree.
//!
//! Every installation sharing a coordinator registers its client as a
//! member. A refresh window covers all members: each one gets a hold
//! interceptor for the duration, not only the client whose failure started
//! the refresh.
//!
//! Lifecycle of one refresh window:
//! 1. First qualifying failure finds `Idle`: the refresh operation is started
//!    on a driver task and hold interceptors are installed on the target and
//!    every member, in one critical section, then the state becomes
//!    `Refreshing`
//! 2. Concurrent failures find `Refreshing` and join the same shared result
//! 3. When the operation settles, the driver ejects every hold interceptor
//!    and returns the state to `Idle` before any waiter observes the outcome
//!
//! The operation runs inside a task-local refresh scope. Requests it issues
//! are never held and its own failures are never intercepted, so a refresh
//! that calls through a guarded client cannot wait on itself.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future::{self, BoxFuture, Shared};
use tracing::{debug, error, info, warn};
use transport::{Client, InterceptorId, WeakClient};

use crate::context::{RefreshContext, RefreshFn};
use crate::error::RefreshError;
use crate::hold;
use crate::metrics;
use crate::options::OnRetry;

tokio::task_local! {
    static REFRESH_SCOPE: u64;
}

/// Whether the current task is running a refresh operation.
pub fn in_refresh_scope() -> bool {
    REFRESH_SCOPE.try_with(|_| ()).is_ok()
}

/// Shared handle to an in-flight refresh; every clone resolves to the same
/// outcome.
pub type SharedRefresh = Shared<BoxFuture<'static, Result<(), RefreshError>>>;

/// Key of a registered member client, used to unregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberKey(u64);

enum CoordinationState {
    Idle,
    Refreshing {
        generation: u64,
        refresh: SharedRefresh,
        holds: Vec<Hold>,
    },
}

/// Hold interceptor installed on one client for the current window.
struct Hold {
    client: Client,
    id: InterceptorId,
}

struct Member {
    key: MemberKey,
    client: WeakClient,
    on_retry: Option<OnRetry>,
}

struct Inner {
    state: CoordinationState,
    members: Vec<Member>,
}

/// Single-flight cache for the refresh operation of one interception scope.
///
/// Installations that should share refresh windows share one coordinator.
pub struct RefreshCoordinator {
    inner: Mutex<Inner>,
    next_generation: AtomicU64,
    next_member: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CoordinationState::Idle,
                members: Vec::new(),
            }),
            next_generation: AtomicU64::new(1),
            next_member: AtomicU64::new(1),
        }
    }

    /// True when no refresh is in flight and no hold interceptor is installed.
    pub fn is_idle(&self) -> bool {
        matches!(self.lock().state, CoordinationState::Idle)
    }

    /// Identifiers of the hold interceptors installed for the in-flight
    /// refresh, one per held client. Empty when idle.
    pub fn hold_interceptors(&self) -> Vec<InterceptorId> {
        match &self.lock().state {
            CoordinationState::Refreshing { holds, .. } => holds.iter().map(|h| h.id).collect(),
            CoordinationState::Idle => Vec::new(),
        }
    }

    /// Generation of the in-flight refresh, if any. Increases by one per
    /// refresh started.
    pub fn generation(&self) -> Option<u64> {
        match &self.lock().state {
            CoordinationState::Refreshing { generation, .. } => Some(*generation),
            CoordinationState::Idle => None,
        }
    }

    /// Number of registered member clients still alive.
    pub fn member_count(&self) -> usize {
        self.lock()
            .members
            .iter()
            .filter(|m| m.client.upgrade().is_some())
            .count()
    }

    /// Put `client` under this coordinator's refresh windows. If a refresh is
    /// already in flight, the client is held for the rest of it.
    pub fn register(&self, client: &Client, on_retry: Option<OnRetry>) -> MemberKey {
        let key = MemberKey(self.next_member.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.lock();
        if let CoordinationState::Refreshing { refresh, holds, .. } = &mut inner.state {
            hold_client(holds, client, refresh, on_retry.clone());
        }
        inner.members.push(Member {
            key,
            client: client.downgrade(),
            on_retry,
        });
        key
    }

    /// Stop holding the member's client in future windows. A hold already
    /// installed for the current window stays until it settles.
    pub fn unregister(&self, key: MemberKey) {
        self.lock().members.retain(|m| m.key != key);
    }

    /// Join the in-flight refresh, or start one.
    ///
    /// When idle, `refresh_fn` is invoked exactly once with `context`, its
    /// future is spawned on the current Tokio runtime, and hold interceptors
    /// are installed on `target` and every member client. When a refresh is
    /// already in flight the existing handle is returned, `target` is held if
    /// it was not yet, and `refresh_fn` is not called.
    ///
    /// Caller contract violations (a panicking refresh function, no runtime
    /// to drive the operation) are logged and returned as an already-failed
    /// refresh; the coordinator stays idle.
    ///
    /// `refresh_fn` is called with the state lock held and must not call
    /// back into this coordinator before returning its future.
    pub fn acquire(
        self: &Arc<Self>,
        context: RefreshContext,
        refresh_fn: &RefreshFn,
        target: &Client,
        on_retry: Option<OnRetry>,
    ) -> SharedRefresh {
        let mut inner = self.lock();
        if let CoordinationState::Refreshing {
            generation,
            refresh,
            holds,
        } = &mut inner.state
        {
            debug!(generation = *generation, "joining in-flight credential refresh");
            hold_client(holds, target, refresh, on_retry);
            return refresh.clone();
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("credential refresh requires a Tokio runtime; failing the request");
            return failed(RefreshError::Contract(
                "no Tokio runtime available to drive the refresh".into(),
            ));
        };

        let operation = match std::panic::catch_unwind(AssertUnwindSafe(|| refresh_fn(context))) {
            Ok(operation) => operation,
            Err(_) => {
                error!("refresh function panicked before returning a future");
                return failed(RefreshError::Contract("refresh function panicked".into()));
            }
        };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let coordinator = Arc::downgrade(self);
        let driver = runtime.spawn(async move {
            let outcome = match AssertUnwindSafe(REFRESH_SCOPE.scope(generation, operation))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(generation, "refresh operation panicked");
                    Err(RefreshError::Contract("refresh operation panicked".into()))
                }
            };

            match &outcome {
                Ok(()) => info!(generation, "credential refresh succeeded"),
                Err(e) => warn!(generation, error = %e, "credential refresh failed"),
            }
            metrics::record_refresh_completed(outcome.is_ok());

            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.settle(generation);
            }
            outcome
        });

        let refresh = async move {
            match driver.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(generation, error = %e, "refresh driver task did not complete");
                    Err(RefreshError::Contract(format!(
                        "refresh task did not complete: {e}"
                    )))
                }
            }
        }
        .boxed()
        .shared();

        let mut holds = Vec::new();
        hold_client(&mut holds, target, &refresh, on_retry);
        inner.members.retain(|m| m.client.upgrade().is_some());
        for member in &inner.members {
            if let Some(client) = member.client.upgrade() {
                hold_client(&mut holds, &client, &refresh, member.on_retry.clone());
            }
        }
        info!(generation, held_clients = holds.len(), "credential refresh started");
        metrics::record_refresh_started();

        inner.state = CoordinationState::Refreshing {
            generation,
            refresh: refresh.clone(),
            holds,
        };
        refresh
    }

    /// End the refresh window for `generation`: eject its hold interceptors
    /// and return to idle.
    ///
    /// A no-op when that generation already settled or a newer refresh has
    /// started since. Returns whether the state changed.
    pub fn settle(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        let current = matches!(
            &inner.state,
            CoordinationState::Refreshing { generation: g, .. } if *g == generation
        );
        if !current {
            return false;
        }

        if let CoordinationState::Refreshing { holds, .. } =
            std::mem::replace(&mut inner.state, CoordinationState::Idle)
        {
            for hold in &holds {
                hold.client.eject_request(hold.id);
            }
            debug!(generation, held_clients = holds.len(), "refresh window closed");
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RefreshCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Install a hold on `client` unless it already has one this window.
fn hold_client(
    holds: &mut Vec<Hold>,
    client: &Client,
    refresh: &SharedRefresh,
    on_retry: Option<OnRetry>,
) {
    if holds.iter().any(|h| h.client.ptr_eq(client)) {
        return;
    }
    let id = hold::install(client, refresh.clone(), on_retry);
    debug!(hold_interceptor = %id, "holding client requests for refresh window");
    holds.push(Hold {
        client: client.clone(),
        id,
    });
}

fn failed(error: RefreshError) -> SharedRefresh {
    future::ready(Err(error)).boxed().shared()
}

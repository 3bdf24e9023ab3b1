//! Response-failure interceptor: the refresh state machine
//!
//! Installed on the target client's response pipeline. For every failed
//! request:
//!
//! 1. Options are laid over the defaults and the failure is classified;
//!    anything that does not qualify is returned unchanged
//! 2. The shared refresh is joined or started (single flight), which also
//!    installs the hold interceptors for the window
//! 3. The listener leaves `Listening`: its hook is ejected, so a refresh
//!    operation calling through the same client cannot recurse into it.
//!    The hold is already in place, so no request slips through between the
//!    two without either
//! 4. On success the original request is replayed from its captured config
//!    and the replay's outcome is returned; on failure the refresh error is
//!    returned instead of the original status
//! 5. The last cycle to finish reinstalls a fresh hook (`Listening` again),
//!    exactly once per `Handling` epoch, whichever branch was taken
//!
//! A replay that fails again with a qualifying status is returned as-is; the
//! next failing request starts a new cycle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use tracing::{debug, error, info};
use transport::{
    BoxFuture, Client, Error, InterceptorId, RequestConfig, Response, ResponseInterceptor,
    WeakClient,
};

use crate::classifier::should_refresh;
use crate::context::{RefreshContext, RefreshFn};
use crate::coordinator::{MemberKey, RefreshCoordinator, in_refresh_scope};
use crate::error::RefreshError;
use crate::metrics;
use crate::options::{OnRetry, RefreshConfig, RefreshOptions};

/// Where the failure hook is in its install/eject cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Listener {
    /// Hook installed under this id.
    Listening(InterceptorId),
    /// Hook ejected while `active` failures are being handled.
    Handling { active: usize, reinstall: bool },
    /// Uninstalled for good.
    Removed,
}

struct Handler {
    target: WeakClient,
    options: RefreshOptions,
    refresh_fn: RefreshFn,
    coordinator: Arc<RefreshCoordinator>,
    member: MemberKey,
    listener: Mutex<Listener>,
}

/// The hook registered on the client; one per `Listening` period.
struct FailureHook(Arc<Handler>);

impl ResponseInterceptor for FailureHook {
    fn on_failure(&self, error: Error) -> BoxFuture<'static, transport::Result<Response>> {
        // Failures of the refresh operation's own requests belong to it
        if in_refresh_scope() {
            return Box::pin(async move { Err(error) });
        }
        let handler = self.0.clone();
        Box::pin(async move { handler.handle(error).await })
    }
}

impl Handler {
    async fn handle(self: Arc<Self>, error: Error) -> transport::Result<Response> {
        let options = self.options.merge_over(&RefreshOptions::defaults());
        if !should_refresh(Some(&error), &options) {
            return Err(error);
        }
        let (Some(target), Some(config)) = (self.target.upgrade(), error.config().cloned()) else {
            return Err(error);
        };

        debug!(
            status = ?error.status(),
            method = %config.method,
            url = %config.url,
            "request failed with qualifying status, refreshing credentials"
        );

        let refresh = self.coordinator.acquire(
            RefreshContext::new(error),
            &self.refresh_fn,
            &target,
            options.on_retry.clone(),
        );
        let _cycle = self.begin_cycle(&target);

        match refresh.await {
            Ok(()) => {
                let config = match &options.on_retry {
                    Some(on_retry) => on_retry(config),
                    None => config,
                };
                debug!(url = %config.url, "replaying request after credential refresh");
                metrics::record_replay();
                target.reissue(config).await
            }
            Err(e) => Err(e.into_transport_error()),
        }
    }

    /// Leave `Listening` (or join the current `Handling` epoch).
    fn begin_cycle(self: &Arc<Self>, target: &Client) -> Cycle {
        let mut listener = self.lock();
        match *listener {
            Listener::Listening(id) => {
                target.eject_response(id);
                *listener = Listener::Handling {
                    active: 1,
                    reinstall: true,
                };
                debug!(interceptor_id = %id, "failure hook ejected while handling");
            }
            Listener::Handling { ref mut active, .. } => *active += 1,
            Listener::Removed => {}
        }
        Cycle {
            handler: self.clone(),
        }
    }

    /// Called once per cycle, on every exit path.
    fn end_cycle(self: &Arc<Self>) {
        let mut listener = self.lock();
        let Listener::Handling { active, reinstall } = *listener else {
            return;
        };
        if active > 1 {
            *listener = Listener::Handling {
                active: active - 1,
                reinstall,
            };
            return;
        }

        *listener = match (reinstall, self.target.upgrade()) {
            (true, Some(target)) => {
                let id = target.use_response(Arc::new(FailureHook(self.clone())));
                debug!(interceptor_id = %id, "failure hook reinstalled");
                Listener::Listening(id)
            }
            _ => Listener::Removed,
        };
    }

    fn lock(&self) -> MutexGuard<'_, Listener> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ends a handling cycle when dropped, including when the caller abandons
/// the request mid-refresh.
struct Cycle {
    handler: Arc<Handler>,
}

impl Drop for Cycle {
    fn drop(&mut self) {
        self.handler.end_cycle();
    }
}

/// Handle to an installed refresh interceptor.
///
/// Dropping the handle leaves the interceptor installed; call
/// [`AuthRefresh::uninstall`] to remove it.
pub struct AuthRefresh {
    handler: Arc<Handler>,
}

impl AuthRefresh {
    pub fn builder() -> AuthRefreshBuilder {
        AuthRefreshBuilder::default()
    }

    /// Whether the failure hook is currently installed.
    pub fn is_listening(&self) -> bool {
        matches!(*self.handler.lock(), Listener::Listening(_))
    }

    /// Id of the installed failure hook, if any.
    pub fn interceptor_id(&self) -> Option<InterceptorId> {
        match *self.handler.lock() {
            Listener::Listening(id) => Some(id),
            _ => None,
        }
    }

    /// Whether a refresh is in flight for this interception scope.
    pub fn is_refreshing(&self) -> bool {
        !self.handler.coordinator.is_idle()
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.handler.coordinator
    }

    /// Remove the failure hook and leave the coordinator. Cycles already in
    /// progress finish normally but do not reinstall it.
    pub fn uninstall(&self) {
        self.handler.coordinator.unregister(self.handler.member);
        let mut listener = self.handler.lock();
        match *listener {
            Listener::Listening(id) => {
                if let Some(target) = self.handler.target.upgrade() {
                    target.eject_response(id);
                }
                *listener = Listener::Removed;
                info!(interceptor_id = %id, "auth refresh interceptor uninstalled");
            }
            Listener::Handling {
                ref mut reinstall, ..
            } => *reinstall = false,
            Listener::Removed => {}
        }
    }
}

impl std::fmt::Debug for AuthRefresh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRefresh")
            .field("listener", &*self.handler.lock())
            .field("options", &self.handler.options)
            .finish()
    }
}

/// Builder for [`AuthRefresh`].
#[derive(Default)]
pub struct AuthRefreshBuilder {
    options: RefreshOptions,
    refresh_fn: Option<RefreshFn>,
    coordinator: Option<Arc<RefreshCoordinator>>,
}

impl AuthRefreshBuilder {
    /// The operation that obtains a new credential. Required.
    pub fn refresh_with<F, Fut, E>(mut self, refresh: F) -> Self
    where
        F: Fn(RefreshContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.refresh_fn = Some(Arc::new(move |context| {
            refresh(context).map(|r| r.map_err(RefreshError::failed)).boxed()
        }));
        self
    }

    /// Attach to `client` instead of the shared default client.
    pub fn target(mut self, client: Client) -> Self {
        self.options.target = Some(client);
        self
    }

    pub fn status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.options.status_codes = Some(codes.into_iter().collect());
        self
    }

    /// Applied to each request before it is replayed or released from hold.
    pub fn on_retry<F>(mut self, on_retry: F) -> Self
    where
        F: Fn(RequestConfig) -> RequestConfig + Send + Sync + 'static,
    {
        self.options.on_retry = Some(Arc::new(on_retry) as OnRetry);
        self
    }

    /// Apply file-backed settings. Later builder calls override them.
    pub fn config(mut self, config: RefreshConfig) -> Self {
        self.options.status_codes = Some(config.status_codes.into_iter().collect());
        self
    }

    /// Replace all caller options at once.
    pub fn options(mut self, options: RefreshOptions) -> Self {
        self.options = options;
        self
    }

    /// Share refresh windows with other installations using the same
    /// coordinator.
    pub fn coordinator(mut self, coordinator: Arc<RefreshCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Install the failure hook on the target client.
    ///
    /// Fails without installing anything if no refresh function was given or
    /// the options are invalid.
    pub fn install(self) -> crate::Result<AuthRefresh> {
        let Some(refresh_fn) = self.refresh_fn else {
            error!("auth refresh interceptor installed without a refresh function");
            return Err(crate::Error::MissingRefreshFunction);
        };
        self.options.validate()?;

        let target = self.options.resolve_target();
        let coordinator = self.coordinator.unwrap_or_default();
        let member = coordinator.register(&target, self.options.on_retry.clone());
        let handler = Arc::new(Handler {
            target: target.downgrade(),
            options: self.options,
            refresh_fn,
            coordinator,
            member,
            listener: Mutex::new(Listener::Removed),
        });

        let id = target.use_response(Arc::new(FailureHook(handler.clone())));
        *handler.lock() = Listener::Listening(id);
        info!(
            interceptor_id = %id,
            status_codes = ?handler.options.merge_over(&RefreshOptions::defaults()).status_codes,
            "auth refresh interceptor installed"
        );

        Ok(AuthRefresh { handler })
    }
}

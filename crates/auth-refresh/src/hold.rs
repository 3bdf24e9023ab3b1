//! Request hold during a refresh window
//!
//! While a refresh is in flight, every request issued through the guarded
//! client waits for it, not only the ones that already failed. Fresh requests
//! therefore cannot race ahead with the stale credential. Two kinds of
//! request pass straight through: those that opted out with
//! `skip_auth_refresh`, and those issued by the refresh operation itself.

use std::sync::Arc;

use tracing::debug;
use transport::{BoxFuture, Client, Error, InterceptorId, RequestConfig, RequestInterceptor};

use crate::coordinator::{SharedRefresh, in_refresh_scope};
use crate::metrics;
use crate::options::OnRetry;

/// Cancellation reason given to held requests when the refresh fails.
pub const REFRESH_FAILED_REASON: &str = "Refresh call failed";

/// Pre-flight interceptor that parks requests until the refresh settles.
pub(crate) struct HoldInterceptor {
    refresh: SharedRefresh,
    on_retry: Option<OnRetry>,
}

impl RequestInterceptor for HoldInterceptor {
    fn on_request(
        &self,
        config: RequestConfig,
    ) -> BoxFuture<'static, transport::Result<RequestConfig>> {
        if config.skip_auth_refresh || in_refresh_scope() {
            return Box::pin(async move { Ok(config) });
        }

        debug!(
            method = %config.method,
            url = %config.url,
            "holding request until credential refresh settles"
        );
        metrics::record_held_request();

        let refresh = self.refresh.clone();
        let on_retry = self.on_retry.clone();
        Box::pin(async move {
            match refresh.await {
                Ok(()) => {
                    debug!(url = %config.url, "releasing held request");
                    Ok(match on_retry {
                        Some(on_retry) => on_retry(config),
                        None => config,
                    })
                }
                Err(e) => {
                    debug!(url = %config.url, error = %e, "cancelling held request");
                    metrics::record_cancelled_request();
                    Err(Error::Cancelled {
                        reason: REFRESH_FAILED_REASON.to_string(),
                    })
                }
            }
        })
    }
}

/// Install a hold interceptor for `refresh` on `target`.
pub(crate) fn install(
    target: &Client,
    refresh: SharedRefresh,
    on_retry: Option<OnRetry>,
) -> InterceptorId {
    target.use_request(Arc::new(HoldInterceptor { refresh, on_retry }))
}

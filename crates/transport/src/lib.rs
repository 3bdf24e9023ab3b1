//! HTTP transport with an interceptor pipeline
//!
//! Wraps a dispatcher (by default `reqwest`) in a `Client` that runs
//! request pre-flight interceptors before dispatch and response interceptors
//! after it. Interceptors are installed and ejected at runtime by
//! `InterceptorId`, which is what lets a higher layer (e.g. credential
//! refresh) hook into every call without per-request retry code.
//!
//! Request flow:
//! 1. `Client::request` snapshots the installed interceptors
//! 2. Request interceptors run newest first; an `Err` aborts the call
//! 3. The `Dispatch` implementation sends the request
//! 4. The outcome is threaded through the response interceptors in order

pub mod client;
pub mod error;
pub mod reqwest_dispatch;
pub mod request;

pub use client::{Client, InterceptorId, WeakClient};
pub use error::{BoxError, Error, Result};
pub use request::{RequestConfig, Response};
pub use reqwest_dispatch::ReqwestDispatch;

pub use reqwest::header::{HeaderMap, HeaderValue};
pub use reqwest::{Method, StatusCode};

use std::future::Future;
use std::pin::Pin;

/// Boxed, sendable future returned by the pipeline traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Sends a single request. The seam between the pipeline and the wire.
///
/// Implementations map non-2xx replies to `Error::Status` and I/O failures to
/// `Error::Network`, keeping the request config in both.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, config: RequestConfig) -> BoxFuture<'_, Result<Response>>;
}

/// Pre-flight hook run before a request is dispatched.
///
/// May rewrite the config, delay it (by not resolving yet), or abort it by
/// returning an error. Returned futures are `'static` so a hook can hold a
/// request across arbitrarily long waits without borrowing the client.
pub trait RequestInterceptor: Send + Sync {
    fn on_request(&self, config: RequestConfig) -> BoxFuture<'static, Result<RequestConfig>>;
}

/// Hook run on every dispatched request's outcome.
pub trait ResponseInterceptor: Send + Sync {
    /// Called with a successful response. Passes it through by default.
    fn on_success(&self, response: Response) -> BoxFuture<'static, Result<Response>> {
        Box::pin(async move { Ok(response) })
    }

    /// Called with a failed outcome. May recover (e.g. by replaying the
    /// request) or propagate the error.
    fn on_failure(&self, error: Error) -> BoxFuture<'static, Result<Response>>;
}

//! Client handle and interceptor registry

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use tracing::debug;

use crate::error::Result;
use crate::request::{RequestConfig, Response};
use crate::reqwest_dispatch::ReqwestDispatch;
use crate::{BoxFuture, Dispatch, RequestInterceptor, ResponseInterceptor};

/// Identifier returned when an interceptor is installed; the key to eject it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterceptorId(u64);

impl fmt::Display for InterceptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Inner {
    dispatch: Arc<dyn Dispatch>,
    next_id: AtomicU64,
    request_interceptors: Mutex<Vec<(InterceptorId, Arc<dyn RequestInterceptor>)>>,
    response_interceptors: Mutex<Vec<(InterceptorId, Arc<dyn ResponseInterceptor>)>>,
}

/// HTTP client with runtime-mutable request and response pipelines.
///
/// Cloning is cheap and every clone shares the same interceptors, so a hook
/// installed through one handle affects requests issued through all of them.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

/// Non-owning handle to a [`Client`].
///
/// Interceptors that need to call back into the client they are installed
/// on hold one of these so the registry does not keep the client alive.
#[derive(Clone)]
pub struct WeakClient {
    inner: Weak<Inner>,
}

impl WeakClient {
    pub fn upgrade(&self) -> Option<Client> {
        self.inner.upgrade().map(|inner| Client { inner })
    }
}

static SHARED_DEFAULT: OnceLock<Client> = OnceLock::new();

impl Client {
    /// Create a client dispatching through `dispatch`.
    pub fn new(dispatch: impl Dispatch + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatch: Arc::new(dispatch),
                next_id: AtomicU64::new(1),
                request_interceptors: Mutex::new(Vec::new()),
                response_interceptors: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a client backed by the given `reqwest::Client`.
    pub fn with_reqwest(http: reqwest::Client) -> Self {
        Self::new(ReqwestDispatch::new(http))
    }

    /// Process-wide default client, created on first use.
    pub fn shared_default() -> Client {
        SHARED_DEFAULT
            .get_or_init(|| Client::with_reqwest(reqwest::Client::new()))
            .clone()
    }

    /// Whether two handles refer to the same client.
    pub fn ptr_eq(&self, other: &Client) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakClient {
        WeakClient {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Install a request pre-flight interceptor.
    ///
    /// Request interceptors run most-recently-installed first, so a hook
    /// installed later sees the request before earlier ones do.
    pub fn use_request(&self, interceptor: Arc<dyn RequestInterceptor>) -> InterceptorId {
        let id = self.next_id();
        lock(&self.inner.request_interceptors).push((id, interceptor));
        debug!(interceptor_id = %id, "request interceptor installed");
        id
    }

    /// Remove a request interceptor. Returns false if it was not installed.
    pub fn eject_request(&self, id: InterceptorId) -> bool {
        let removed = eject(&self.inner.request_interceptors, id);
        if removed {
            debug!(interceptor_id = %id, "request interceptor ejected");
        }
        removed
    }

    /// Install a response interceptor at the end of the pipeline.
    pub fn use_response(&self, interceptor: Arc<dyn ResponseInterceptor>) -> InterceptorId {
        let id = self.next_id();
        lock(&self.inner.response_interceptors).push((id, interceptor));
        debug!(interceptor_id = %id, "response interceptor installed");
        id
    }

    /// Remove a response interceptor. Returns false if it was not installed.
    pub fn eject_response(&self, id: InterceptorId) -> bool {
        let removed = eject(&self.inner.response_interceptors, id);
        if removed {
            debug!(interceptor_id = %id, "response interceptor ejected");
        }
        removed
    }

    pub fn request_interceptor_count(&self) -> usize {
        lock(&self.inner.request_interceptors).len()
    }

    pub fn response_interceptor_count(&self) -> usize {
        lock(&self.inner.response_interceptors).len()
    }

    /// Issue a request through the pipeline.
    ///
    /// The interceptor lists are captured when this is called, not when the
    /// returned future is first polled: hooks installed or ejected afterwards
    /// do not affect a request that is already in flight.
    pub fn request(&self, config: RequestConfig) -> BoxFuture<'static, Result<Response>> {
        let dispatch = self.inner.dispatch.clone();
        let request_interceptors = snapshot(&self.inner.request_interceptors);
        let response_interceptors = snapshot(&self.inner.response_interceptors);

        Box::pin(async move {
            let mut outcome = async {
                let mut config = config;
                for interceptor in request_interceptors.iter().rev() {
                    config = interceptor.on_request(config).await?;
                }
                dispatch.dispatch(config).await
            }
            .await;

            for interceptor in &response_interceptors {
                outcome = match outcome {
                    Ok(response) => interceptor.on_success(response).await,
                    Err(error) => interceptor.on_failure(error).await,
                };
            }
            outcome
        })
    }

    /// Re-issue a request from its captured configuration.
    pub fn reissue(&self, config: RequestConfig) -> BoxFuture<'static, Result<Response>> {
        debug!(method = %config.method, url = %config.url, "reissuing request");
        self.request(config)
    }

    fn next_id(&self) -> InterceptorId {
        InterceptorId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("request_interceptors", &self.request_interceptor_count())
            .field("response_interceptors", &self.response_interceptor_count())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn snapshot<T: ?Sized>(registry: &Mutex<Vec<(InterceptorId, Arc<T>)>>) -> Vec<Arc<T>> {
    lock(registry).iter().map(|(_, hook)| hook.clone()).collect()
}

fn eject<T: ?Sized>(registry: &Mutex<Vec<(InterceptorId, Arc<T>)>>, id: InterceptorId) -> bool {
    let mut hooks = lock(registry);
    let before = hooks.len();
    hooks.retain(|(installed, _)| *installed != id);
    hooks.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use bytes::Bytes;
    use reqwest::StatusCode;
    use reqwest::header::{HeaderMap, HeaderValue};
    use std::sync::atomic::AtomicUsize;

    /// Dispatcher that answers with a fixed status and records every URL.
    struct Recorder {
        status: StatusCode,
        seen: Arc<Mutex<Vec<RequestConfig>>>,
    }

    impl Dispatch for Recorder {
        fn dispatch(&self, config: RequestConfig) -> BoxFuture<'_, Result<Response>> {
            self.seen.lock().unwrap().push(config.clone());
            let status = self.status;
            Box::pin(async move {
                let response = Response {
                    status,
                    headers: HeaderMap::new(),
                    body: Bytes::from_static(b"ok"),
                    config,
                };
                if status.is_success() {
                    Ok(response)
                } else {
                    Err(Error::Status {
                        response: Box::new(response),
                    })
                }
            })
        }
    }

    fn recording_client(status: StatusCode) -> (Client, Arc<Mutex<Vec<RequestConfig>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let client = Client::new(Recorder {
            status,
            seen: seen.clone(),
        });
        (client, seen)
    }

    struct StampHeader(&'static str);

    impl RequestInterceptor for StampHeader {
        fn on_request(
            &self,
            mut config: RequestConfig,
        ) -> BoxFuture<'static, Result<RequestConfig>> {
            let value = self.0;
            Box::pin(async move {
                config
                    .headers
                    .append("x-stamp", HeaderValue::from_static(value));
                Ok(config)
            })
        }
    }

    struct Reject;

    impl RequestInterceptor for Reject {
        fn on_request(&self, _config: RequestConfig) -> BoxFuture<'static, Result<RequestConfig>> {
            Box::pin(async {
                Err(Error::Cancelled {
                    reason: "blocked".into(),
                })
            })
        }
    }

    /// Turns any failure into a synthetic 200 and counts calls.
    struct Recover {
        failures: Arc<AtomicUsize>,
    }

    impl ResponseInterceptor for Recover {
        fn on_failure(&self, error: Error) -> BoxFuture<'static, Result<Response>> {
            self.failures.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                let config = error
                    .config()
                    .cloned()
                    .unwrap_or_else(|| RequestConfig::get("about:blank"));
                Ok(Response {
                    status: StatusCode::OK,
                    headers: HeaderMap::new(),
                    body: Bytes::from_static(b"recovered"),
                    config,
                })
            })
        }
    }

    #[tokio::test]
    async fn request_interceptors_run_most_recent_first() {
        let (client, seen) = recording_client(StatusCode::OK);
        client.use_request(Arc::new(StampHeader("first")));
        client.use_request(Arc::new(StampHeader("second")));

        client
            .request(RequestConfig::get("http://upstream.test/a"))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        let stamps: Vec<_> = seen[0].headers.get_all("x-stamp").iter().collect();
        assert_eq!(stamps, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn failing_request_interceptor_prevents_dispatch() {
        let (client, seen) = recording_client(StatusCode::OK);
        client.use_request(Arc::new(Reject));

        let err = client
            .request(RequestConfig::get("http://upstream.test/a"))
            .await
            .unwrap_err();

        assert_eq!(err.cancel_reason(), Some("blocked"));
        assert!(seen.lock().unwrap().is_empty(), "request must not be sent");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error_without_interceptors() {
        let (client, _) = recording_client(StatusCode::UNAUTHORIZED);
        let err = client
            .request(RequestConfig::get("http://upstream.test/a"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn response_interceptor_can_recover_failure() {
        let (client, _) = recording_client(StatusCode::UNAUTHORIZED);
        let failures = Arc::new(AtomicUsize::new(0));
        client.use_response(Arc::new(Recover {
            failures: failures.clone(),
        }));

        let response = client
            .request(RequestConfig::get("http://upstream.test/a"))
            .await
            .unwrap();
        assert_eq!(response.text(), "recovered");
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_passes_through_response_interceptor() {
        let (client, _) = recording_client(StatusCode::OK);
        let failures = Arc::new(AtomicUsize::new(0));
        client.use_response(Arc::new(Recover {
            failures: failures.clone(),
        }));

        let response = client
            .request(RequestConfig::get("http://upstream.test/a"))
            .await
            .unwrap();
        assert_eq!(response.text(), "ok");
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ejected_interceptor_no_longer_runs() {
        let (client, seen) = recording_client(StatusCode::OK);
        let id = client.use_request(Arc::new(Reject));
        assert!(client.eject_request(id));
        assert!(!client.eject_request(id), "second eject must be a no-op");

        client
            .request(RequestConfig::get("http://upstream.test/a"))
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(client.request_interceptor_count(), 0);
    }

    #[tokio::test]
    async fn interceptors_are_snapshotted_at_call_time() {
        let (client, seen) = recording_client(StatusCode::OK);
        let pending = client.request(RequestConfig::get("http://upstream.test/a"));

        // Installed after the call was issued: must not affect it
        client.use_request(Arc::new(Reject));

        pending.await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn interceptor_ids_are_unique_across_pipelines() {
        let (client, _) = recording_client(StatusCode::OK);
        let a = client.use_request(Arc::new(StampHeader("a")));
        let b = client.use_response(Arc::new(Recover {
            failures: Arc::new(AtomicUsize::new(0)),
        }));
        assert_ne!(a, b);
        assert!(!client.eject_response(a), "ids are pipeline-specific");
    }

    #[test]
    fn clones_share_interceptors() {
        let (client, _) = recording_client(StatusCode::OK);
        let other = client.clone();
        other.use_request(Arc::new(StampHeader("shared")));
        assert_eq!(client.request_interceptor_count(), 1);
        assert!(client.ptr_eq(&other));
    }

    #[test]
    fn weak_client_does_not_keep_client_alive() {
        let (client, _) = recording_client(StatusCode::OK);
        let weak = client.downgrade();
        assert!(weak.upgrade().unwrap().ptr_eq(&client));
        drop(client);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn shared_default_is_a_singleton() {
        assert!(Client::shared_default().ptr_eq(&Client::shared_default()));
    }
}

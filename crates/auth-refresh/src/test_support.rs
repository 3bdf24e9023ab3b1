//! In-memory upstream and credential helpers shared by the unit tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use transport::{BoxFuture, Client, Dispatch, HeaderMap, RequestConfig, Response, StatusCode};

use crate::options::OnRetry;

/// Token the upstream accepts.
pub(crate) const FRESH_TOKEN: &str = "at_fresh";

/// Header naming an artificial response latency in milliseconds.
pub(crate) const DELAY_HEADER: &str = "x-delay-ms";

/// One request as seen by the upstream.
#[derive(Debug, Clone)]
pub(crate) struct Dispatched {
    pub url: String,
    pub authorization: Option<String>,
    pub body: Bytes,
    pub at: tokio::time::Instant,
}

/// Scripted upstream:
/// - `*/oauth/token` → 200 (token endpoint, no credential needed)
/// - `*/forbidden` → 403, `*/boom` → 500
/// - `*/session` → 419 unless authorized
/// - anything else → 200 with `Bearer at_fresh`, 401 otherwise
#[derive(Clone, Default)]
pub(crate) struct Upstream {
    log: Arc<Mutex<Vec<Dispatched>>>,
}

impl Upstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self) -> Client {
        Client::new(self.clone())
    }

    pub fn dispatched(&self) -> Vec<Dispatched> {
        self.log.lock().unwrap().clone()
    }

    pub fn dispatched_to(&self, suffix: &str) -> Vec<Dispatched> {
        self.dispatched()
            .into_iter()
            .filter(|d| d.url.ends_with(suffix))
            .collect()
    }
}

impl Dispatch for Upstream {
    fn dispatch(&self, config: RequestConfig) -> BoxFuture<'_, transport::Result<Response>> {
        let authorization = config
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.log.lock().unwrap().push(Dispatched {
            url: config.url.clone(),
            authorization: authorization.clone(),
            body: config.body.clone(),
            at: tokio::time::Instant::now(),
        });
        let delay = config
            .headers
            .get(DELAY_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis);

        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let expected = format!("Bearer {FRESH_TOKEN}");
            let authorized = authorization.as_deref() == Some(expected.as_str());
            let status = if config.url.ends_with("/oauth/token") {
                StatusCode::OK
            } else if config.url.ends_with("/forbidden") {
                StatusCode::FORBIDDEN
            } else if config.url.ends_with("/boom") {
                StatusCode::INTERNAL_SERVER_ERROR
            } else if authorized {
                StatusCode::OK
            } else if config.url.ends_with("/session") {
                StatusCode::from_u16(419).unwrap()
            } else {
                StatusCode::UNAUTHORIZED
            };
            let body = Bytes::from(format!("{} {}", status.as_u16(), config.url));
            let response = Response {
                status,
                headers: HeaderMap::new(),
                body,
                config,
            };
            if status.is_success() {
                Ok(response)
            } else {
                Err(transport::Error::Status {
                    response: Box::new(response),
                })
            }
        })
    }
}

/// Client-side credential cell.
#[derive(Clone)]
pub(crate) struct TokenCell(Arc<Mutex<String>>);

impl TokenCell {
    pub fn new(token: &str) -> Self {
        Self(Arc::new(Mutex::new(token.to_string())))
    }

    pub fn get(&self) -> String {
        self.0.lock().unwrap().clone()
    }

    pub fn set(&self, token: &str) {
        *self.0.lock().unwrap() = token.to_string();
    }

    /// GET `url` with the current token.
    pub fn request(&self, url: &str) -> RequestConfig {
        RequestConfig::get(url)
            .header("authorization", &format!("Bearer {}", self.get()))
            .unwrap()
    }

    /// Re-stamps the authorization header with the current token.
    pub fn on_retry(&self) -> OnRetry {
        let cell = self.clone();
        Arc::new(move |config: RequestConfig| {
            config
                .header("authorization", &format!("Bearer {}", cell.get()))
                .unwrap()
        })
    }
}

/// A 401 failure for `url`, as the transport would report it.
pub(crate) fn unauthorized_error(url: &str) -> transport::Error {
    transport::Error::Status {
        response: Box::new(Response {
            status: StatusCode::UNAUTHORIZED,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            config: RequestConfig::get(url),
        }),
    }
}

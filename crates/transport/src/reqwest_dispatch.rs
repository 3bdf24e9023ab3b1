//! `reqwest`-backed dispatcher
//!
//! Sends a `RequestConfig` as-is: headers, body and timeout are forwarded
//! without modification. The response body is buffered so the outcome can be
//! passed through interceptors and replayed.

use tracing::debug;

use crate::error::{Error, Result};
use crate::request::{RequestConfig, Response};
use crate::{BoxFuture, Dispatch};

/// Dispatcher that sends requests over a shared `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestDispatch {
    http: reqwest::Client,
}

impl ReqwestDispatch {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl Dispatch for ReqwestDispatch {
    fn dispatch(&self, config: RequestConfig) -> BoxFuture<'_, Result<Response>> {
        Box::pin(async move {
            let mut builder = self
                .http
                .request(config.method.clone(), &config.url)
                .headers(config.headers.clone())
                .body(config.body.clone());
            if let Some(timeout) = config.timeout {
                builder = builder.timeout(timeout);
            }

            let upstream = match builder.send().await {
                Ok(r) => r,
                Err(e) => {
                    debug!(url = %config.url, error = %e, "request failed before a response");
                    return Err(Error::Network {
                        config: Box::new(config),
                        message: e.to_string(),
                    });
                }
            };

            let status = upstream.status();
            let headers = upstream.headers().clone();
            let body = match upstream.bytes().await {
                Ok(b) => b,
                Err(e) => {
                    return Err(Error::Network {
                        config: Box::new(config),
                        message: format!("failed to read response body: {e}"),
                    });
                }
            };

            let response = Response {
                status,
                headers,
                body,
                config,
            };
            if status.is_success() {
                Ok(response)
            } else {
                debug!(
                    url = %response.config.url,
                    status = status.as_u16(),
                    "upstream returned error status"
                );
                Err(Error::Status {
                    response: Box::new(response),
                })
            }
        })
    }
}

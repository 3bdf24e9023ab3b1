//! Error types for transport operations

use std::sync::Arc;

use reqwest::StatusCode;

use crate::request::{RequestConfig, Response};

/// Boxed error produced outside the transport (e.g. a credential refresh)
/// and surfaced through the pipeline.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors from issuing a request through a [`Client`](crate::Client).
///
/// Every variant that stems from a dispatched request keeps that request's
/// [`RequestConfig`] so an interceptor can re-issue it unchanged.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Upstream replied with a non-2xx status.
    #[error("request to {} failed with status {}", .response.config.url, .response.status)]
    Status { response: Box<Response> },

    /// The request never produced a response (connect, timeout, body read).
    #[error("request to {} failed: {message}", .config.url)]
    Network {
        config: Box<RequestConfig>,
        message: String,
    },

    /// A request interceptor aborted the request before dispatch.
    #[error("request cancelled: {reason}")]
    Cancelled { reason: String },

    /// The request configuration could not be turned into a request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A credential refresh run on behalf of this request failed.
    #[error("credential refresh failed: {0}")]
    Refresh(#[source] BoxError),
}

impl Error {
    /// Status code of the failed response, if one was received.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Status { response } => Some(response.status),
            _ => None,
        }
    }

    /// The failed response, if one was received.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Error::Status { response } => Some(response),
            _ => None,
        }
    }

    /// Configuration of the request that failed, when it is known.
    pub fn config(&self) -> Option<&RequestConfig> {
        match self {
            Error::Status { response } => Some(&response.config),
            Error::Network { config, .. } => Some(config),
            _ => None,
        }
    }

    /// Whether a request interceptor cancelled the request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// Cancellation reason, if the request was cancelled.
    pub fn cancel_reason(&self) -> Option<&str> {
        match self {
            Error::Cancelled { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

//! The caller-supplied refresh operation and the context it receives

use std::sync::Arc;

use futures_util::future::BoxFuture;
use transport::{Error, RequestConfig, Response, StatusCode};

use crate::error::RefreshError;

/// Boxed refresh operation. Called at most once per refresh window; the
/// returned future obtains a new credential.
pub type RefreshFn =
    Arc<dyn Fn(RefreshContext) -> BoxFuture<'static, Result<(), RefreshError>> + Send + Sync>;

/// The failure that started a refresh, handed to the refresh operation.
#[derive(Debug, Clone)]
pub struct RefreshContext {
    error: Error,
}

impl RefreshContext {
    pub fn new(error: Error) -> Self {
        Self { error }
    }

    pub fn error(&self) -> &Error {
        &self.error
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.error.status()
    }

    pub fn response(&self) -> Option<&Response> {
        self.error.response()
    }

    /// Configuration of the request that failed.
    pub fn config(&self) -> Option<&RequestConfig> {
        self.error.config()
    }

    pub fn into_error(self) -> Error {
        self.error
    }
}

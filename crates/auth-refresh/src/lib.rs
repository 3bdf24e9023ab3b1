//! Automatic credential refresh for a transport client
//!
//! When a request fails with an authorization status, the interceptor
//! obtains a new credential exactly once, holds every other request until
//! it is ready, then replays the failed requests. Callers write no per-request
//! retry logic.
//!
//! Components:
//! - `classifier` decides which failures qualify
//! - `coordinator` keeps at most one refresh in flight per interception scope
//! - `hold` parks outgoing requests for the duration of a refresh
//! - `interceptor` ties them together on the client's response pipeline
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use auth_refresh::AuthRefresh;
//! use transport::{Client, RequestConfig};
//!
//! let client = Client::shared_default();
//! let _refresh = AuthRefresh::builder()
//!     .target(client.clone())
//!     .refresh_with(|_failure| async { Ok::<(), std::io::Error>(()) })
//!     .install()?;
//!
//! let response = client
//!     .request(RequestConfig::get("https://api.example.com/v1/items"))
//!     .await?;
//! println!("{}", response.status);
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod hold;
pub mod interceptor;
mod metrics;
pub mod options;

#[cfg(test)]
mod test_support;

pub use classifier::should_refresh;
pub use context::{RefreshContext, RefreshFn};
pub use coordinator::{MemberKey, RefreshCoordinator, SharedRefresh, in_refresh_scope};
pub use error::{ConfigError, Error, RefreshError, Result};
pub use hold::REFRESH_FAILED_REASON;
pub use interceptor::{AuthRefresh, AuthRefreshBuilder};
pub use options::{DEFAULT_STATUS_CODES, OnRetry, RefreshConfig, RefreshOptions};

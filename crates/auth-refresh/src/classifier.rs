//! Failure classification
//!
//! Decides whether a failed request qualifies for credential refresh. Only
//! failures that carry a response can qualify: network errors, cancellations
//! and refresh errors never have a status to match.

use transport::Error;

use crate::options::RefreshOptions;

/// Whether `error` should trigger a credential refresh under `options`.
///
/// False when there is no error, no response, the request opted out with
/// `skip_auth_refresh`, or the status is not one of the configured codes.
pub fn should_refresh(error: Option<&Error>, options: &RefreshOptions) -> bool {
    let Some(response) = error.and_then(Error::response) else {
        return false;
    };
    if response.config.skip_auth_refresh {
        return false;
    }
    options.qualifies(response.status.as_u16())
}

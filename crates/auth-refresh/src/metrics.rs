//! Refresh coordination metrics
//!
//! - `auth_refresh_started_total` (counter): refresh operations started
//! - `auth_refresh_completed_total` (counter): label `outcome` (`success`, `failure`)
//! - `auth_refresh_held_requests_total` (counter): requests held behind a refresh
//! - `auth_refresh_cancelled_requests_total` (counter): held requests cancelled
//!   because the refresh failed
//! - `auth_refresh_replays_total` (counter): failed requests replayed after refresh
//!
//! Without an installed recorder every call is a no-op.

pub(crate) fn record_refresh_started() {
    metrics::counter!("auth_refresh_started_total").increment(1);
}

pub(crate) fn record_refresh_completed(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    metrics::counter!("auth_refresh_completed_total", "outcome" => outcome).increment(1);
}

pub(crate) fn record_held_request() {
    metrics::counter!("auth_refresh_held_requests_total").increment(1);
}

pub(crate) fn record_cancelled_request() {
    metrics::counter!("auth_refresh_cancelled_requests_total").increment(1);
}

pub(crate) fn record_replay() {
    metrics::counter!("auth_refresh_replays_total").increment(1);
}

//! Refresh options and file configuration
//!
//! `RefreshOptions` is what the caller passes at installation time. Every
//! field is optional; on each failure the caller's options are laid over
//! [`RefreshOptions::defaults`] with a shallow override (a field the caller
//! set replaces the default wholesale, nothing is merged inside it).
//!
//! `RefreshConfig` is the serializable subset, loaded from a TOML file:
//!
//! ```toml
//! [auth_refresh]
//! status_codes = [401, 419]
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use transport::{Client, RequestConfig};

use crate::error::ConfigError;

/// Status codes that trigger a refresh when the caller does not choose.
pub const DEFAULT_STATUS_CODES: &[u16] = &[401];

/// Hook applied to a request before it is replayed or released from hold.
///
/// Typically stamps the freshly obtained credential onto the request, since
/// the captured configuration still carries the stale one.
pub type OnRetry = Arc<dyn Fn(RequestConfig) -> RequestConfig + Send + Sync>;

/// Options for one interceptor installation.
#[derive(Clone, Default)]
pub struct RefreshOptions {
    /// Client to attach to. Defaults to [`Client::shared_default`].
    pub target: Option<Client>,
    /// Status codes that qualify a failure for refresh.
    pub status_codes: Option<BTreeSet<u16>>,
    pub on_retry: Option<OnRetry>,
}

impl RefreshOptions {
    /// The defaults every installation is merged over.
    pub fn defaults() -> Self {
        Self {
            target: None,
            status_codes: Some(DEFAULT_STATUS_CODES.iter().copied().collect()),
            on_retry: None,
        }
    }

    /// Lay `self` over `base`: fields set on `self` win, unset fields are
    /// taken from `base`.
    pub fn merge_over(&self, base: &RefreshOptions) -> RefreshOptions {
        RefreshOptions {
            target: self.target.clone().or_else(|| base.target.clone()),
            status_codes: self
                .status_codes
                .clone()
                .or_else(|| base.status_codes.clone()),
            on_retry: self.on_retry.clone().or_else(|| base.on_retry.clone()),
        }
    }

    /// Whether a failure with `status` qualifies for refresh.
    pub fn qualifies(&self, status: u16) -> bool {
        match &self.status_codes {
            Some(codes) => codes.contains(&status),
            None => DEFAULT_STATUS_CODES.contains(&status),
        }
    }

    /// The client these options attach to.
    pub fn resolve_target(&self) -> Client {
        self.target.clone().unwrap_or_else(Client::shared_default)
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if let Some(codes) = &self.status_codes {
            validate_status_codes(codes.iter().copied())
                .map_err(crate::Error::InvalidOptions)?;
        }
        Ok(())
    }
}

impl fmt::Debug for RefreshOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshOptions")
            .field("target", &self.target)
            .field("status_codes", &self.status_codes)
            .field("on_retry", &self.on_retry.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// File-backed refresh settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_status_codes")]
    pub status_codes: Vec<u16>,
}

/// Root of the TOML document; only the `[auth_refresh]` table is read.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    auth_refresh: RefreshConfig,
}

fn default_status_codes() -> Vec<u16> {
    DEFAULT_STATUS_CODES.to_vec()
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            status_codes: default_status_codes(),
        }
    }
}

impl RefreshConfig {
    /// Load the `[auth_refresh]` table from a TOML file.
    ///
    /// A missing table yields the defaults; a present but invalid one is an
    /// error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(contents)?;
        validate_status_codes(file.auth_refresh.status_codes.iter().copied())
            .map_err(ConfigError::Invalid)?;
        Ok(file.auth_refresh)
    }

    /// Caller options carrying these settings.
    pub fn into_options(self) -> RefreshOptions {
        RefreshOptions {
            status_codes: Some(self.status_codes.into_iter().collect()),
            ..RefreshOptions::default()
        }
    }
}

fn validate_status_codes(codes: impl IntoIterator<Item = u16>) -> Result<(), String> {
    let mut empty = true;
    for code in codes {
        empty = false;
        if !(100..=599).contains(&code) {
            return Err(format!("status code {code} is outside 100..=599"));
        }
    }
    if empty {
        return Err("status_codes must not be empty".into());
    }
    Ok(())
}

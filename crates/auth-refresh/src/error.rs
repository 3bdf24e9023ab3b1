//! Error types for credential refresh coordination

use std::path::PathBuf;
use std::sync::Arc;

use transport::BoxError;

/// Errors raised while installing the refresh interceptor.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no refresh function provided; call refresh_with() before install()")]
    MissingRefreshFunction,

    #[error("invalid refresh options: {0}")]
    InvalidOptions(String),
}

/// Result alias for installation operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading a refresh configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid auth_refresh settings: {0}")]
    Invalid(String),
}

/// Outcome of a failed credential refresh, shared by every waiter.
///
/// Cloneable because a single refresh result fans out to the triggering
/// request, its siblings and every held request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RefreshError {
    /// The caller's refresh operation returned an error.
    #[error("{0}")]
    Failed(BoxError),

    /// The refresh function broke its contract (panicked, or could not be
    /// driven to completion).
    #[error("refresh function contract violation: {0}")]
    Contract(String),
}

impl RefreshError {
    pub fn failed(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        RefreshError::Failed(Arc::new(error))
    }

    /// Convert into the rejection surfaced to the request that triggered the
    /// refresh. A caller's own error is passed through as the source.
    pub fn into_transport_error(self) -> transport::Error {
        match self {
            RefreshError::Failed(source) => transport::Error::Refresh(source),
            contract @ RefreshError::Contract(_) => transport::Error::Refresh(Arc::new(contract)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_error_names_the_file() {
        let err = ConfigError::Read {
            path: PathBuf::from("/etc/app/refresh.toml"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert_eq!(err.to_string(), "failed to read /etc/app/refresh.toml: not found");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn missing_refresh_function_message_is_actionable() {
        assert!(
            Error::MissingRefreshFunction
                .to_string()
                .contains("refresh_with()")
        );
    }

    #[test]
    fn failed_refresh_surfaces_caller_error_as_source() {
        let err = RefreshError::failed(std::io::Error::other("token endpoint returned 400"))
            .into_transport_error();
        assert!(matches!(err, transport::Error::Refresh(_)), "got: {err:?}");
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "token endpoint returned 400");
    }

    #[test]
    fn contract_violation_is_wrapped_as_source() {
        let err = RefreshError::Contract("refresh function panicked".into()).into_transport_error();
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(
            source.to_string(),
            "refresh function contract violation: refresh function panicked"
        );
    }
}

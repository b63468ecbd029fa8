use crate::{adapter::AdapterError, replica::errors::FailoverError};
use std::time::Duration;
use thiserror::Error;

/// Errors from loading or refreshing configuration.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProviderError {
    /// The store could not serve a request.
    #[error("Store request failed: {0}")]
    Failover(FailoverError),

    /// An adapter rejected a setting.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// Some watched keys could not be refreshed. Changes detected on the
    /// other keys were still published.
    #[error("{failed} of {checked} watched keys failed to refresh, first error: {first}")]
    RefreshFailed { failed: usize, checked: usize, first: Box<ProviderError> },

    /// The initial load kept failing until the startup timeout elapsed.
    #[error("Initial load did not succeed within {timeout:?}: {last}")]
    StartupTimeout { timeout: Duration, last: Box<ProviderError> },

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<FailoverError> for ProviderError {
    fn from(e: FailoverError) -> Self {
        match e {
            FailoverError::Cancelled => Self::Cancelled,
            other => Self::Failover(other),
        }
    }
}

impl ProviderError {
    /// Returns `true` if retrying the whole operation later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Failover(e) => e.is_transient(),
            Self::RefreshFailed { first, .. } => first.is_transient(),
            Self::Adapter(_) | Self::StartupTimeout { .. } | Self::Cancelled => false,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

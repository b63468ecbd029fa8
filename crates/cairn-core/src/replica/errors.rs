use thiserror::Error;

/// How a store failure affects failover.
///
/// The executor branches on this tag and nothing else:
/// - `Retryable` fails over to the next replica and backs the endpoint off
/// - `NonRetryable` stops immediately without touching endpoint state
/// - `NotFound` is a valid answer, not a failure
/// - `Cancelled` is caller-initiated and always propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    Retryable,
    NonRetryable,
    NotFound,
    Cancelled,
}

impl FailureClass {
    /// Returns a static string representation for metrics labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::NonRetryable => "non_retryable",
            Self::NotFound => "not_found",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Errors surfaced by a [`ConfigStoreClient`](super::client::ConfigStoreClient).
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum StoreError {
    /// Request exceeded the transport timeout.
    #[error("Request timeout")]
    Timeout,

    /// Failed to establish a connection (DNS, socket, TLS handshake).
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Lower-level I/O failure wrapped by the transport.
    #[error("I/O error: {0}")]
    Io(String),

    /// Non-2xx status from the store.
    ///
    /// First field is the HTTP status code, second is the error message.
    #[error("HTTP error {0}: {1}")]
    HttpError(u16, String),

    /// The request was rejected before it reached the store.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The store answered with something that could not be decoded.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,
}

impl StoreError {
    /// Classifies this error for the failover policy.
    ///
    /// Retryable: timeouts, connection and I/O failures, and HTTP
    /// 408/429/500/502/503/504. HTTP 404 is `NotFound`. Everything else,
    /// including 401/403 and malformed requests, is `NonRetryable`.
    #[must_use]
    pub fn classify(&self) -> FailureClass {
        match self {
            Self::Timeout | Self::ConnectionFailed(_) | Self::Io(_) => FailureClass::Retryable,
            Self::HttpError(status, _) => match status {
                408 | 429 | 500 | 502 | 503 | 504 => FailureClass::Retryable,
                404 => FailureClass::NotFound,
                _ => FailureClass::NonRetryable,
            },
            Self::Cancelled => FailureClass::Cancelled,
            Self::InvalidRequest(_) | Self::InvalidResponse(_) => FailureClass::NonRetryable,
        }
    }

    /// Returns `true` if another replica may succeed where this one failed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.classify() == FailureClass::Retryable
    }
}

/// Outcome of a [`FailoverExecutor`](super::executor::FailoverExecutor) call
/// that did not produce a value.
///
/// Low-level store errors never cross the executor boundary unwrapped: callers
/// above it see success, `NotFound`, or one of the unrecoverable variants.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FailoverError {
    /// The store answered that the requested entry does not exist.
    #[error("Not found at {endpoint}")]
    NotFound { endpoint: String },

    /// A replica returned an error that retrying elsewhere cannot fix.
    #[error("Request to {endpoint} failed: {source}")]
    NonRetryable {
        endpoint: String,
        #[source]
        source: StoreError,
    },

    /// Every candidate replica failed with a retryable error.
    #[error("All {attempts} replica attempts failed, last error: {last}")]
    Exhausted { attempts: usize, last: StoreError },

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,
}

impl FailoverError {
    /// Returns `true` if waiting and trying again later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Errors constructing or refreshing a [`ReplicaClientPool`](super::pool::ReplicaClientPool).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PoolError {
    /// No static endpoints were configured and discovery found none.
    #[error("Replica pool requires at least one endpoint")]
    Empty,

    /// The client factory could not build a client for an endpoint.
    #[error("Failed to create client for {endpoint}: {source}")]
    ClientInit {
        endpoint: String,
        #[source]
        source: StoreError,
    },
}

use super::{
    backoff::{BackoffPolicy, EndpointState},
    client::ConfigStoreClient,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc};
use tokio::time::Instant;
use url::Url;

/// Address of one replica of the configuration store.
///
/// Equality is by normalised URL, so `https://a.example` and
/// `https://a.example/` name the same endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    /// Parses an endpoint URL.
    ///
    /// # Errors
    ///
    /// Returns [`url::ParseError`] if `s` is not an absolute URL with a host.
    pub fn parse(s: &str) -> Result<Self, url::ParseError> {
        let url = Url::parse(s)?;
        if url.host_str().is_none() {
            return Err(url::ParseError::EmptyHost);
        }
        Ok(Self { url })
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Host name, used as the endpoint's label in logs and metrics.
    #[must_use]
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }
}

impl FromStr for Endpoint {
    type Err = url::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = url::ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.url.into()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// Where a pool member came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointSource {
    /// Listed in configuration. Never removed by discovery refreshes.
    Static,
    /// Found by replica discovery.
    Discovered,
}

/// A pool member: endpoint address, its client, and its backoff state.
///
/// The state lock is never held across an await.
pub struct ReplicaEndpoint {
    endpoint: Endpoint,
    source: EndpointSource,
    client: Arc<dyn ConfigStoreClient>,
    state: Mutex<EndpointState>,
}

impl ReplicaEndpoint {
    #[must_use]
    pub fn new(endpoint: Endpoint, source: EndpointSource, client: Arc<dyn ConfigStoreClient>) -> Self {
        Self { endpoint, source, client, state: Mutex::new(EndpointState::new(Instant::now())) }
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    #[must_use]
    pub fn source(&self) -> EndpointSource {
        self.source
    }

    #[must_use]
    pub fn client(&self) -> &Arc<dyn ConfigStoreClient> {
        &self.client
    }

    #[must_use]
    pub fn is_available(&self, now: Instant) -> bool {
        self.state.lock().is_available(now)
    }

    /// Returns a copy of the current backoff state.
    #[must_use]
    pub fn state(&self) -> EndpointState {
        *self.state.lock()
    }

    pub fn record_outcome(&self, success: bool, now: Instant, policy: &BackoffPolicy) {
        let mut state = self.state.lock();
        state.record_result(success, now, policy);

        if !success {
            tracing::warn!(
                endpoint = %self.endpoint,
                consecutive_failures = state.consecutive_failures(),
                backoff_ms = state.retry_after().saturating_duration_since(now).as_millis(),
                "replica backed off after failure"
            );
        }
    }
}

impl fmt::Debug for ReplicaEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaEndpoint")
            .field("endpoint", &self.endpoint)
            .field("source", &self.source)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

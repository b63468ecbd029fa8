//! Abstraction over the remote configuration store.
//!
//! Transport details (HTTP, authentication, payload shapes) live behind these
//! traits. The failover and refresh machinery only needs three operations.

use super::{endpoint::Endpoint, errors::StoreError};
use crate::types::{ChangeCheck, ChangeToken, ConfigSetting, KeyIdentity, SettingSelector, SettingsPage};
use async_trait::async_trait;
use std::sync::Arc;

/// Client for one replica of the configuration store.
#[async_trait]
pub trait ConfigStoreClient: Send + Sync + 'static {
    /// Fetches a single setting. `Ok(None)` means the key does not exist.
    async fn fetch_one(&self, identity: &KeyIdentity) -> Result<Option<ConfigSetting>, StoreError>;

    /// Fetches one page of settings matching `selector`.
    ///
    /// `continuation` is the token returned with the previous page; it is only
    /// meaningful to the replica that issued it.
    async fn fetch_page(
        &self,
        selector: &SettingSelector,
        continuation: Option<&str>,
    ) -> Result<SettingsPage, StoreError>;

    /// Compares `known` against the stored change token without transferring
    /// the value.
    async fn check_changed(
        &self,
        identity: &KeyIdentity,
        known: Option<&ChangeToken>,
    ) -> Result<ChangeCheck, StoreError>;
}

/// Builds clients for endpoints.
///
/// Holds whatever is shared across replicas (credentials, transport pools) so
/// the pool can create clients for endpoints found by discovery.
pub trait ClientFactory: Send + Sync + 'static {
    /// Creates a client bound to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the client cannot be constructed.
    fn create_client(&self, endpoint: &Endpoint) -> Result<Arc<dyn ConfigStoreClient>, StoreError>;
}

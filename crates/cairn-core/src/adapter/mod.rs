//! Turning raw settings into configuration keys.
//!
//! Each fetched setting passes through an ordered list of adapters. The first
//! adapter whose predicate accepts the setting transforms it into zero or more
//! `(key, value)` pairs (for example by flattening a JSON document). A setting
//! no adapter accepts is passed through as its own key and value. Configured
//! key prefixes are stripped from the results, longest prefix first.

use crate::types::ConfigSetting;
use async_trait::async_trait;
use std::{fmt, sync::Arc};
use thiserror::Error;
use tracing::debug;

/// An adapter could not process a setting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Adapter '{adapter}' failed on key '{key}': {message}")]
pub struct AdapterError {
    pub adapter: String,
    pub key: String,
    pub message: String,
}

impl AdapterError {
    #[must_use]
    pub fn new(adapter: impl Into<String>, key: impl Into<String>, message: impl Into<String>) -> Self {
        Self { adapter: adapter.into(), key: key.into(), message: message.into() }
    }
}

/// Transforms settings it recognizes into flat key/value pairs.
///
/// `process` may suspend (secret resolution reaches out to another service).
#[async_trait]
pub trait SettingAdapter: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn can_process(&self, setting: &ConfigSetting) -> bool;

    async fn process(&self, setting: &ConfigSetting) -> Result<Vec<(String, String)>, AdapterError>;
}

type Predicate = dyn Fn(&ConfigSetting) -> bool + Send + Sync;
type Transform = dyn Fn(&ConfigSetting) -> Result<Vec<(String, String)>, String> + Send + Sync;

/// Adapter built from a pair of synchronous closures.
pub struct FnAdapter {
    name: String,
    predicate: Box<Predicate>,
    transform: Box<Transform>,
}

impl FnAdapter {
    pub fn new<P, T>(name: impl Into<String>, predicate: P, transform: T) -> Self
    where
        P: Fn(&ConfigSetting) -> bool + Send + Sync + 'static,
        T: Fn(&ConfigSetting) -> Result<Vec<(String, String)>, String> + Send + Sync + 'static,
    {
        Self { name: name.into(), predicate: Box::new(predicate), transform: Box::new(transform) }
    }

    /// Adapter for settings whose content type starts with `content_type`.
    pub fn for_content_type<T>(name: impl Into<String>, content_type: &str, transform: T) -> Self
    where
        T: Fn(&ConfigSetting) -> Result<Vec<(String, String)>, String> + Send + Sync + 'static,
    {
        let content_type = content_type.to_ascii_lowercase();
        Self::new(
            name,
            move |setting| {
                setting
                    .content_type
                    .as_deref()
                    .is_some_and(|ct| ct.to_ascii_lowercase().starts_with(&content_type))
            },
            transform,
        )
    }
}

#[async_trait]
impl SettingAdapter for FnAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_process(&self, setting: &ConfigSetting) -> bool {
        (self.predicate)(setting)
    }

    async fn process(&self, setting: &ConfigSetting) -> Result<Vec<(String, String)>, AdapterError> {
        (self.transform)(setting).map_err(|message| AdapterError::new(&self.name, &setting.key, message))
    }
}

impl fmt::Debug for FnAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAdapter").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Ordered adapters plus key-prefix trimming.
#[derive(Clone, Default)]
pub struct AdapterPipeline {
    adapters: Vec<Arc<dyn SettingAdapter>>,
    /// Sorted longest first.
    trim_prefixes: Vec<String>,
}

impl AdapterPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_adapter(mut self, adapter: Arc<dyn SettingAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    #[must_use]
    pub fn with_trim_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trim_prefixes.extend(prefixes.into_iter().map(Into::into).filter(|p| !p.is_empty()));
        self.trim_prefixes.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        self.trim_prefixes.dedup();
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Resolves one setting into configuration keys.
    ///
    /// A setting without a value produces no keys.
    ///
    /// # Errors
    ///
    /// Returns the [`AdapterError`] of the adapter that claimed the setting.
    pub async fn process(&self, setting: &ConfigSetting) -> Result<Vec<(String, String)>, AdapterError> {
        let pairs = match self.adapters.iter().find(|a| a.can_process(setting)) {
            Some(adapter) => {
                debug!(adapter = adapter.name(), key = %setting.key, "adapter processing setting");
                adapter.process(setting).await?
            }
            None => match &setting.value {
                Some(value) => vec![(setting.key.clone(), value.clone())],
                None => Vec::new(),
            },
        };

        Ok(pairs.into_iter().map(|(key, value)| (self.trim_key(key), value)).collect())
    }

    fn trim_key(&self, key: String) -> String {
        match self.trim_prefixes.iter().find(|prefix| key.starts_with(prefix.as_str())) {
            Some(prefix) => key[prefix.len()..].to_string(),
            None => key,
        }
    }
}

impl fmt::Debug for AdapterPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.adapters.iter().map(|a| a.name()).collect();
        f.debug_struct("AdapterPipeline")
            .field("adapters", &names)
            .field("trim_prefixes", &self.trim_prefixes)
            .finish()
    }
}

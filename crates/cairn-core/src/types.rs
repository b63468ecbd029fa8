//! Shared domain types for settings, selectors, and change tokens.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Key filter that matches every key in the store.
pub const ANY_KEY: &str = "*";

/// Identity of a setting in the store: a key optionally scoped by a label.
///
/// Two settings with the same key but different labels are distinct entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyIdentity {
    pub key: String,
    #[serde(default)]
    pub label: Option<String>,
}

impl KeyIdentity {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into(), label: None }
    }

    #[must_use]
    pub fn with_label(key: impl Into<String>, label: impl Into<String>) -> Self {
        Self { key: key.into(), label: Some(label.into()) }
    }

    /// Returns `true` if `setting` is the stored entry this identity refers to.
    #[must_use]
    pub fn matches(&self, setting: &ConfigSetting) -> bool {
        self.key == setting.key && self.label == setting.label
    }
}

impl fmt::Display for KeyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{} [{}]", self.key, label),
            None => f.write_str(&self.key),
        }
    }
}

/// Opaque token (an etag) that changes whenever the stored value changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeToken(String);

impl ChangeToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A raw setting as returned by the store, before any adapter runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSetting {
    pub key: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    /// Media type hint used by adapters to decide whether they apply.
    #[serde(default)]
    pub content_type: Option<String>,
    pub etag: ChangeToken,
}

impl ConfigSetting {
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>, etag: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            label: None,
            value: Some(value.into()),
            content_type: None,
            etag: ChangeToken::new(etag),
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    #[must_use]
    pub fn identity(&self) -> KeyIdentity {
        KeyIdentity { key: self.key.clone(), label: self.label.clone() }
    }
}

/// Chooses which settings a full load reads from the store.
///
/// `key_filter` supports a trailing `*` wildcard; `label_filter` of `None`
/// selects settings without a label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SettingSelector {
    #[serde(default = "default_key_filter")]
    pub key_filter: String,
    #[serde(default)]
    pub label_filter: Option<String>,
}

fn default_key_filter() -> String {
    ANY_KEY.to_string()
}

impl Default for SettingSelector {
    fn default() -> Self {
        Self { key_filter: default_key_filter(), label_filter: None }
    }
}

impl SettingSelector {
    #[must_use]
    pub fn new(key_filter: impl Into<String>, label_filter: Option<String>) -> Self {
        Self { key_filter: key_filter.into(), label_filter }
    }

    /// Evaluates the selector locally. Store clients may use this to filter
    /// an in-memory data set; remote clients pass the filters to the service.
    #[must_use]
    pub fn matches(&self, setting: &ConfigSetting) -> bool {
        let key_matches = match self.key_filter.strip_suffix('*') {
            Some(prefix) => setting.key.starts_with(prefix),
            None => setting.key == self.key_filter,
        };
        key_matches && setting.label == self.label_filter
    }
}

impl fmt::Display for SettingSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label_filter {
            Some(label) => write!(f, "{} [{}]", self.key_filter, label),
            None => f.write_str(&self.key_filter),
        }
    }
}

/// One page of a listing. `continuation` is `None` on the last page.
#[derive(Debug, Clone, Default)]
pub struct SettingsPage {
    pub items: Vec<ConfigSetting>,
    pub continuation: Option<String>,
}

/// Result of comparing a known change token against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCheck {
    /// The stored token equals the known token.
    Unchanged,
    /// The entry exists and its token differs from the known one (or none was known).
    Modified,
    /// The entry does not exist in the store.
    Missing,
}

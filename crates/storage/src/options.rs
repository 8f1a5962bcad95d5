use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

/// Free-form backend options from `CLUSTER_STORAGE_OPTIONS`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageOptions(HashMap<String, String>);

impl StorageOptions {
    pub fn new(options: HashMap<String, String>) -> Self {
        Self(options)
    }

    pub fn from_json(raw: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Non-blank value for `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.0
            .get(key)
            .filter(|v| !v.trim().is_empty())
            .cloned()
    }

    pub fn required(&self, key: &'static str) -> Result<String> {
        self.get(key).ok_or(StorageError::MissingOption(key))
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(default)
    }

    pub fn u64_or(&self, key: &str, default: u64) -> Result<u64> {
        match self.get(key) {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| StorageError::InvalidConfig(format!("{} must be a number", key))),
            None => Ok(default),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StorageOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

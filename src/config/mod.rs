//! Configuration consumed by the daemons.
//!
//! Parsing a configuration *file* is the embedding application's job; this
//! crate only reads typed values out of the flat key-value map the external
//! loader provides. [`keys`] names the keys, [`settings`] turns them into
//! typed settings structs with the documented defaults.

mod keys;
mod settings;

pub use keys::*;
pub use settings::DbSettings;

use std::collections::HashMap;
use std::str::FromStr;

/// Flat key-value view of the application configuration.
///
/// Values are kept as strings and converted on access; a missing key or an
/// unparsable value both fall back to the caller's default.
#[derive(Debug, Clone, Default)]
pub struct ConfigMap {
    values: HashMap<String, String>,
}

impl ConfigMap {
    /// Creates an empty map (every lookup yields the default).
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a raw value, replacing any previous one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Raw string value for `key`, if present.
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Typed value for `key`, if present and parsable.
    pub fn get<T: FromStr>(&self, key: &str) -> Option<T> {
        self.values.get(key).and_then(|v| v.parse().ok())
    }

    /// Typed value for `key`, or `default` when absent or unparsable.
    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConfigMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

// SPDX-FileCopyrightText: © 2025 Chime Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Configuration store collaborator.
//!
//! A flat string key/value store with dotted keys (`effect.order.0`,
//! `vorbis.enabled`). Components register keys with a default the first
//! time they need them, so the full configuration surface becomes visible
//! to clients even before anything was explicitly set. TOML input is
//! flattened: nested tables contribute dotted prefixes, arrays contribute
//! numeric suffixes.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{ChimeError, Result};

/// Thread-safe configuration store.
#[derive(Debug, Default)]
pub struct ConfigStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document into a store with flattened dotted keys.
    ///
    /// # Errors
    ///
    /// Returns [`ChimeError::Configuration`] on invalid TOML.
    pub fn from_toml(text: &str) -> Result<Self> {
        let table: toml::Table = text
            .parse()
            .map_err(|e| ChimeError::Configuration(format!("invalid configuration: {e}")))?;
        let store = Self::new();
        {
            let mut values = store.lock();
            flatten_table(&table, "", &mut values);
        }
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `key` with a default. The first registration wins; the
    /// current value is returned either way.
    pub fn register(&self, key: &str, default: &str) -> String {
        self.lock().entry(key.to_string()).or_insert_with(|| default.to_string()).clone()
    }

    /// Current value of `key`, if it was ever registered or set.
    pub fn lookup(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.lock().insert(key.to_string(), value.to_string());
    }

    /// All keys in sorted order, for diagnostics.
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

fn flatten_value(value: &toml::Value, key: &str, out: &mut BTreeMap<String, String>) {
    match value {
        toml::Value::Table(table) => flatten_table(table, key, out),
        toml::Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                flatten_value(item, &format!("{key}.{index}"), out);
            }
        }
        toml::Value::String(s) => {
            out.insert(key.to_string(), s.clone());
        }
        other => {
            out.insert(key.to_string(), other.to_string());
        }
    }
}

fn flatten_table(table: &toml::Table, prefix: &str, out: &mut BTreeMap<String, String>) {
    for (name, value) in table {
        let key = if prefix.is_empty() { name.clone() } else { format!("{prefix}.{name}") };
        flatten_value(value, &key, out);
    }
}

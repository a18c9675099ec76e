// SPDX-FileCopyrightText: © 2025 Chime Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Media-library collaborator interface.
//!
//! The chain core never talks to storage directly; it goes through the
//! [`MediaLibrary`] / [`MediaSession`] traits. Properties are typed
//! (string or int) and attributed to a *source*: the server itself or a
//! plugin (`plugin/<shortname>`), so a rescan can replace one plugin's
//! contribution without touching the rest.
//!
//! [`MemoryLibrary`] is the in-process implementation backing tests and
//! single-process deployments. The module also hosts the daemon's URL
//! percent-codec, which deliberately leaves `/` and `:` intact so encoded
//! URLs stay readable and `encode ∘ decode` is the identity on paths.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::value::Value;

/// A media-library entry id. Stable across sessions.
pub type Entry = u32;

/// "No entry": browse and probe chains carry this and never touch the
/// library.
pub const NO_ENTRY: Entry = 0;

/// Source name owned by the daemon itself.
pub const SERVER_SOURCE: &str = "server";

/// Source id the server name always resolves to.
pub const SERVER_SOURCE_ID: u32 = 1;

/// Well-known entry property names.
pub mod properties {
    pub const URL: &str = "url";
    pub const CHAIN: &str = "chain";
    pub const TIMES_PLAYED: &str = "timesplayed";
    pub const LAST_STARTED: &str = "laststarted";
    pub const STATUS: &str = "status";
    pub const SAMPLE_FORMAT: &str = "sample_format";
    pub const SAMPLERATE: &str = "samplerate";
    pub const CHANNELS: &str = "channels";
    pub const SIZE: &str = "size";
    pub const LMOD: &str = "lmod";
}

/// Resolve status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    New,
    Ok,
    Resolving,
    NotAvailable,
}

impl EntryStatus {
    pub const fn code(self) -> i32 {
        match self {
            Self::New => 0,
            Self::Ok => 1,
            Self::Resolving => 2,
            Self::NotAvailable => 3,
        }
    }
}

/// One open library session. Writes become visible to other sessions at
/// [`MediaSession::commit`]; implementations may apply them eagerly.
pub trait MediaSession {
    fn property_get_str(&self, entry: Entry, key: &str) -> Option<String>;
    fn property_get_int(&self, entry: Entry, key: &str) -> Option<i32>;

    /// Set a property attributed to the server source.
    fn property_set_str(&mut self, entry: Entry, key: &str, value: &str);
    fn property_set_int(&mut self, entry: Entry, key: &str, value: i32);

    /// Set a property attributed to an explicit source id.
    fn property_set_str_source(&mut self, entry: Entry, key: &str, value: &str, source: u32);
    fn property_set_int_source(&mut self, entry: Entry, key: &str, value: i32, source: u32);

    /// Drop stale per-source properties, keeping the server's own.
    fn entry_cleanup(&mut self, entry: Entry);

    fn entry_status_set(&mut self, entry: Entry, status: EntryStatus);

    /// Map a source name (`server`, `plugin/<shortname>`) to its id,
    /// allocating one on first sight.
    fn source_to_id(&mut self, name: &str) -> u32;

    fn commit(self: Box<Self>);
}

/// The media library itself. Shared immutably across the chain.
pub trait MediaLibrary: Send + Sync {
    fn begin(&self) -> Box<dyn MediaSession + '_>;
    fn begin_write(&self) -> Box<dyn MediaSession + '_>;

    /// Emit an "entry updated" notification to interested clients.
    fn entry_send_update(&self, entry: Entry);
}

// --- URL codec ---------------------------------------------------------

/// Everything outside `[A-Za-z0-9._~:/-]` gets percent-encoded.
const URL_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b':')
    .remove(b'/');

/// Percent-encode a URL or path component, preserving slashes.
pub fn url_encode(raw: &str) -> String {
    utf8_percent_encode(raw, URL_ENCODE_SET).to_string()
}

/// Decode `%XX` escapes. Malformed escapes pass through unchanged;
/// byte sequences that do not form UTF-8 yield `None`.
pub fn url_decode(encoded: &str) -> Option<String> {
    percent_decode_str(encoded).decode_utf8().ok().map(std::borrow::Cow::into_owned)
}

// --- In-process implementation -----------------------------------------

#[derive(Debug, Default)]
struct LibraryState {
    sources: IndexMap<String, u32>,
    /// (entry, key) → per-source values, in insertion order of sources.
    props: HashMap<(Entry, String), Vec<(u32, Value)>>,
    next_entry: Entry,
    updates: Vec<Entry>,
}

impl LibraryState {
    fn set(&mut self, entry: Entry, key: &str, value: Value, source: u32) {
        let slot = self.props.entry((entry, key.to_string())).or_default();
        if let Some(existing) = slot.iter_mut().find(|(s, _)| *s == source) {
            existing.1 = value;
        } else {
            slot.push((source, value));
        }
    }

    fn get(&self, entry: Entry, key: &str) -> Option<&Value> {
        let slot = self.props.get(&(entry, key.to_string()))?;
        slot.iter()
            .find(|(s, _)| *s == SERVER_SOURCE_ID)
            .or_else(|| slot.iter().min_by_key(|(s, _)| *s))
            .map(|(_, v)| v)
    }
}

/// In-process [`MediaLibrary`] over a plain hash map.
#[derive(Debug, Default)]
pub struct MemoryLibrary {
    state: Mutex<LibraryState>,
}

impl MemoryLibrary {
    pub fn new() -> Self {
        let library = Self::default();
        library.lock().sources.insert(SERVER_SOURCE.to_string(), SERVER_SOURCE_ID);
        library
    }

    fn lock(&self) -> MutexGuard<'_, LibraryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an entry for `url` and return its id.
    pub fn add_entry(&self, url: &str) -> Entry {
        let mut state = self.lock();
        state.next_entry += 1;
        let entry = state.next_entry;
        state.set(entry, properties::URL, Value::from(url), SERVER_SOURCE_ID);
        entry
    }

    /// Entries for which an update notification was sent, in order.
    pub fn updates(&self) -> Vec<Entry> {
        self.lock().updates.clone()
    }

    /// Full property snapshot of one entry: `(key, source, value)`.
    pub fn snapshot(&self, entry: Entry) -> Vec<(String, u32, Value)> {
        let state = self.lock();
        let mut out = Vec::new();
        for ((e, key), slot) in &state.props {
            if *e != entry {
                continue;
            }
            for (source, value) in slot {
                out.push((key.clone(), *source, value.clone()));
            }
        }
        out.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
        out
    }

    /// Resolve an already-allocated source id without creating one.
    pub fn source_id(&self, name: &str) -> Option<u32> {
        self.lock().sources.get(name).copied()
    }
}

impl MediaLibrary for MemoryLibrary {
    fn begin(&self) -> Box<dyn MediaSession + '_> {
        Box::new(MemorySession { state: self.lock() })
    }

    fn begin_write(&self) -> Box<dyn MediaSession + '_> {
        Box::new(MemorySession { state: self.lock() })
    }

    fn entry_send_update(&self, entry: Entry) {
        tracing::debug!("entry {} updated", entry);
        self.lock().updates.push(entry);
    }
}

struct MemorySession<'a> {
    state: MutexGuard<'a, LibraryState>,
}

impl MediaSession for MemorySession<'_> {
    fn property_get_str(&self, entry: Entry, key: &str) -> Option<String> {
        match self.state.get(entry, key)? {
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn property_get_int(&self, entry: Entry, key: &str) -> Option<i32> {
        self.state.get(entry, key)?.as_int()
    }

    fn property_set_str(&mut self, entry: Entry, key: &str, value: &str) {
        self.state.set(entry, key, Value::from(value), SERVER_SOURCE_ID);
    }

    fn property_set_int(&mut self, entry: Entry, key: &str, value: i32) {
        self.state.set(entry, key, Value::Int32(value), SERVER_SOURCE_ID);
    }

    fn property_set_str_source(&mut self, entry: Entry, key: &str, value: &str, source: u32) {
        self.state.set(entry, key, Value::from(value), source);
    }

    fn property_set_int_source(&mut self, entry: Entry, key: &str, value: i32, source: u32) {
        self.state.set(entry, key, Value::Int32(value), source);
    }

    fn entry_cleanup(&mut self, entry: Entry) {
        for ((e, _), slot) in self.state.props.iter_mut() {
            if *e == entry {
                slot.retain(|(source, _)| *source == SERVER_SOURCE_ID);
            }
        }
        self.state.props.retain(|_, slot| !slot.is_empty());
    }

    fn entry_status_set(&mut self, entry: Entry, status: EntryStatus) {
        self.state.set(entry, properties::STATUS, Value::Int32(status.code()), SERVER_SOURCE_ID);
    }

    fn source_to_id(&mut self, name: &str) -> u32 {
        if let Some(id) = self.state.sources.get(name) {
            return *id;
        }
        let id = self.state.sources.values().max().copied().unwrap_or(0) + 1;
        self.state.sources.insert(name.to_string(), id);
        id
    }

    fn commit(self: Box<Self>) {}
}

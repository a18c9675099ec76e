// SPDX-FileCopyrightText: © 2025 Chime Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! One node of the transform chain.
//!
//! A [`Stage`] owns a plugin instance, a read buffer, a hotspot queue,
//! per-stage metadata, and the exclusive reference to its upstream stage.
//! The consumer pulls bytes from the tail stage; each plugin pulls from
//! its upstream through [`StageData`], which is also where plugins set
//! metadata and private data.
//!
//! Hotspots are the position-exact side channel: a plugin publishing
//! `(key, value)` while producing bytes creates a hotspot at the current
//! buffer offset, and the value lands in the stage's private data exactly
//! when the downstream reader has consumed up to that byte. Reads never
//! straddle a queued hotspot boundary.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use chime_core::medialib::{Entry, MediaLibrary, NO_ENTRY};
use chime_core::{url_encode, ChimeError, Result, StreamType, Value};
use indexmap::IndexMap;

use crate::plugin::{SeekWhence, Transform, XformPlugin};

/// Granularity of plugin reads into the internal buffer.
pub const READ_CHUNK: usize = 4096;

/// Capacity of the line-read carry buffer, terminator included.
pub const MAX_LINE_SIZE: usize = 4096;

/// A pending private-data event at an exact buffer offset.
#[derive(Debug)]
pub(crate) struct Hotspot {
    /// Byte offset within the stage's current buffer contents.
    pub(crate) pos: usize,
    pub(crate) key: String,
    pub(crate) value: Value,
}

#[derive(Debug)]
struct LineRead {
    buf: [u8; MAX_LINE_SIZE],
    len: usize,
}

impl Default for LineRead {
    fn default() -> Self {
        Self { buf: [0; MAX_LINE_SIZE], len: 0 }
    }
}

fn find_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

/// Everything of a stage a plugin instance may touch during a call.
///
/// Split out of [`Stage`] so a plugin method can borrow it mutably while
/// the stage still holds the instance itself.
pub struct StageData {
    pub(crate) prev: Option<Box<Stage>>,
    pub(crate) plugin: Option<Arc<XformPlugin>>,
    pub(crate) entry: Entry,
    pub(crate) out_type: Option<StreamType>,
    pub(crate) goal_hints: Arc<[StreamType]>,
    pub(crate) library: Arc<dyn MediaLibrary>,

    pub(crate) eos: bool,
    pub(crate) error: bool,

    buffer: Vec<u8>,
    pub(crate) buffered: usize,
    pub(crate) hotspots: VecDeque<Hotspot>,

    pub(crate) metadata: IndexMap<String, Value>,
    pub(crate) metadata_changed: bool,
    pub(crate) metadata_collected: bool,

    pub(crate) privdata: HashMap<String, Value>,

    browse_list: Vec<IndexMap<String, Value>>,

    lr: LineRead,
}

/// One node in the chain: plugin instance plus its [`StageData`].
pub struct Stage {
    pub(crate) data: StageData,
    xform: Option<Box<dyn Transform>>,
}

impl std::fmt::Debug for StageData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageData")
            .field("entry", &self.entry)
            .field("out_type", &self.out_type)
            .field("eos", &self.eos)
            .field("error", &self.error)
            .field("buffered", &self.buffered)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage").field("data", &self.data).finish_non_exhaustive()
    }
}

/// A failed stage construction, carrying the upstream chain back to the
/// caller so effect insertion can continue on the old tail.
pub(crate) struct InitFailure {
    pub(crate) error: ChimeError,
    pub(crate) prev: Option<Box<Stage>>,
}

impl StageData {
    fn new(
        prev: Option<Box<Stage>>,
        plugin: Option<Arc<XformPlugin>>,
        entry: Entry,
        goal_hints: Arc<[StreamType]>,
        library: Arc<dyn MediaLibrary>,
    ) -> Self {
        Self {
            prev,
            plugin,
            entry,
            out_type: None,
            goal_hints,
            library,
            eos: false,
            error: false,
            buffer: vec![0; READ_CHUNK],
            buffered: 0,
            hotspots: VecDeque::new(),
            metadata: IndexMap::new(),
            metadata_changed: false,
            metadata_collected: false,
            privdata: HashMap::new(),
            browse_list: Vec::new(),
            lr: LineRead::default(),
        }
    }

    pub fn shortname(&self) -> &str {
        self.plugin.as_ref().map_or("unknown", |p| p.shortname())
    }

    pub const fn entry(&self) -> Entry {
        self.entry
    }

    pub fn goal_hints(&self) -> &[StreamType] {
        &self.goal_hints
    }

    // --- stream types ---------------------------------------------------

    pub fn set_out_type(&mut self, out_type: StreamType) {
        self.out_type = Some(out_type);
    }

    /// Pass the upstream format through unchanged.
    pub fn copy_out_type_from_prev(&mut self) {
        self.out_type = self.prev.as_ref().and_then(|p| p.data.out_type.clone());
    }

    pub const fn out_type(&self) -> Option<&StreamType> {
        self.out_type.as_ref()
    }

    /// The format this stage consumes, i.e. the upstream output.
    pub fn in_type(&self) -> Option<&StreamType> {
        self.prev.as_ref().and_then(|p| p.data.out_type.as_ref())
    }

    pub fn in_str(&self, key: chime_core::StreamKey) -> Option<&str> {
        self.in_type().and_then(|t| t.get_str(key))
    }

    pub fn in_int(&self, key: chime_core::StreamKey) -> i32 {
        self.in_type().map_or(-1, |t| t.get_int(key))
    }

    /// Walk upstream formats toward the source for a string key.
    pub fn in_find_str(&self, key: chime_core::StreamKey) -> Option<&str> {
        let mut cur = self.prev.as_deref();
        while let Some(stage) = cur {
            if let Some(value) = stage.data.out_type.as_ref().and_then(|t| t.get_str(key)) {
                return Some(value);
            }
            cur = stage.data.prev.as_deref();
        }
        None
    }

    /// The URL this chain was built for, found on the nearest upstream
    /// stage that advertises one.
    pub fn url(&self) -> Option<&str> {
        self.in_find_str(chime_core::StreamKey::Url)
    }

    /// Whether the upstream stage has hit end of stream.
    pub fn is_eos(&self) -> bool {
        self.prev.as_ref().is_none_or(|p| p.data.eos)
    }

    // --- upstream I/O ---------------------------------------------------

    /// Pull bytes from the upstream stage.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.prev.as_mut() {
            Some(prev) => prev.read(buf),
            None => {
                Err(ChimeError::ProtocolViolation("no upstream stage to read from".to_string()))
            }
        }
    }

    /// Look ahead into the upstream stage without consuming.
    pub fn peek(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.prev.as_mut() {
            Some(prev) => prev.peek(buf),
            None => {
                Err(ChimeError::ProtocolViolation("no upstream stage to peek into".to_string()))
            }
        }
    }

    /// Reposition the upstream stage.
    pub fn seek(&mut self, offset: i64, whence: SeekWhence) -> Result<u64> {
        match self.prev.as_mut() {
            Some(prev) => prev.seek(offset, whence),
            None => Err(ChimeError::ProtocolViolation("no upstream stage to seek".to_string())),
        }
    }

    /// Read one line from upstream, stripping `\n` and at most one
    /// preceding `\r`. `Ok(None)` on end of stream with an empty carry.
    /// A final unterminated line is returned as-is.
    pub fn read_line(&mut self) -> Result<Option<String>> {
        let mut newline = find_newline(&self.lr.buf[..self.lr.len]);

        if newline.is_none() {
            let space = (MAX_LINE_SIZE - 1) - self.lr.len;
            if space > 0 {
                let mut chunk = [0u8; MAX_LINE_SIZE];
                let got = self.read(&mut chunk[..space])?;
                let len = self.lr.len;
                self.lr.buf[len..len + got].copy_from_slice(&chunk[..got]);
                self.lr.len += got;
            }
            if self.lr.len == 0 {
                return Ok(None);
            }
            newline = find_newline(&self.lr.buf[..self.lr.len]);
        }

        let (end, consumed) = match newline {
            Some(pos) => (pos, pos + 1),
            None => (self.lr.len, self.lr.len),
        };
        let end = if end > 0 && self.lr.buf[end - 1] == b'\r' { end - 1 } else { end };
        let line = String::from_utf8_lossy(&self.lr.buf[..end]).into_owned();

        let rest = self.lr.len - consumed;
        self.lr.buf.copy_within(consumed..consumed + rest, 0);
        self.lr.len = rest;

        Ok(Some(line))
    }

    // --- metadata -------------------------------------------------------

    pub fn metadata_set_int(&mut self, key: &str, value: i32) {
        tracing::debug!("Setting '{}' to {}", key, value);
        self.metadata.insert(key.to_string(), Value::Int32(value));
        self.metadata_changed = true;
    }

    pub fn metadata_set_str(&mut self, key: &str, value: &str) {
        if self.metadata_get_str(key).is_some_and(|old| old == value) {
            return;
        }
        self.metadata.insert(key.to_string(), Value::from(value));
        self.metadata_changed = true;
    }

    fn metadata_value(&self, key: &str) -> Option<&Value> {
        if let Some(value) = self.metadata.get(key) {
            return Some(value);
        }
        let mut cur = self.prev.as_deref();
        while let Some(stage) = cur {
            if let Some(value) = stage.data.metadata.get(key) {
                return Some(value);
            }
            cur = stage.data.prev.as_deref();
        }
        None
    }

    /// Look the key up on this stage, then walk toward the source.
    pub fn metadata_get_str(&self, key: &str) -> Option<&str> {
        self.metadata_value(key)?.as_str()
    }

    pub fn metadata_get_int(&self, key: &str) -> Option<i32> {
        self.metadata_value(key)?.as_int()
    }

    pub fn metadata_has(&self, key: &str) -> bool {
        self.metadata_value(key).is_some()
    }

    /// Write-through of this stage's metadata while the chain is playing.
    /// No play counters are touched here.
    pub(crate) fn metadata_update(&mut self) {
        if self.entry == NO_ENTRY {
            return;
        }
        let library = self.library.clone();
        let mut session = library.begin_write();
        crate::collect::collect_one(self, session.as_mut());
        session.commit();
        library.entry_send_update(self.entry);
    }

    // --- private data and hotspots --------------------------------------

    fn privdata_enqueue(&mut self, key: &str, value: Value) {
        self.hotspots.push_back(Hotspot { pos: self.buffered, key: key.to_string(), value });
    }

    pub fn privdata_set_int(&mut self, key: &str, value: i32) {
        self.privdata_enqueue(key, Value::Int32(value));
    }

    pub fn privdata_set_str(&mut self, key: &str, value: &str) {
        // skip when the most recently published value for this key is
        // unchanged
        let current = self
            .hotspots
            .iter()
            .rev()
            .find(|hs| hs.key == key)
            .map(|hs| &hs.value)
            .or_else(|| self.privdata.get(key));
        if current.and_then(|v| v.as_str()) == Some(value) {
            return;
        }
        self.privdata_enqueue(key, Value::from(value));
    }

    pub fn privdata_set_bin(&mut self, key: &str, data: &[u8]) {
        self.privdata_enqueue(key, Value::Binary(Bytes::copy_from_slice(data)));
    }

    /// Private data published by the upstream stage. Hotspots sitting at
    /// the exact current boundary are visible before they are drained.
    fn privdata_value(&self, key: &str) -> Option<&Value> {
        let prev = self.prev.as_deref()?;
        let data = &prev.data;
        let mut found = None;
        for hs in &data.hotspots {
            if hs.pos != 0 {
                break;
            }
            if hs.key == key {
                found = Some(&hs.value);
            }
        }
        found.or_else(|| data.privdata.get(key))
    }

    pub fn privdata_get_int(&self, key: &str) -> Option<i32> {
        self.privdata_value(key)?.as_int()
    }

    pub fn privdata_get_str(&self, key: &str) -> Option<&str> {
        self.privdata_value(key)?.as_str()
    }

    pub fn privdata_get_bin(&self, key: &str) -> Option<&[u8]> {
        self.privdata_value(key)?.as_bytes()
    }

    pub fn privdata_has(&self, key: &str) -> bool {
        self.privdata_value(key).is_some()
    }

    /// Drain boundary hotspots into private data; the position of the
    /// next pending hotspot, if any, bounds the upcoming read.
    pub(crate) fn hotspots_update(&mut self) -> Option<usize> {
        while self.hotspots.front().is_some_and(|hs| hs.pos == 0) {
            if let Some(hs) = self.hotspots.pop_front() {
                self.privdata.insert(hs.key, hs.value);
            }
        }
        self.hotspots.front().map(|hs| hs.pos)
    }

    // --- browse ---------------------------------------------------------

    /// Add one directory entry for the URL this chain points at.
    /// Entry names cannot contain `/`.
    pub fn browse_add_entry(&mut self, filename: &str, is_dir: bool) {
        if filename.contains('/') {
            tracing::warn!("browse entry '{}' contains a slash, ignoring", filename);
            return;
        }
        let Some(url) = self.url().map(str::to_owned) else {
            tracing::warn!("browse entry '{}' has no base url, ignoring", filename);
            return;
        };
        let eurl = url_encode(&url);
        let efile = url_encode(filename);
        // a trailing slash on the base (file:///) must not double up
        let path =
            if url.ends_with('/') { format!("{eurl}{efile}") } else { format!("{eurl}/{efile}") };

        let mut dict = IndexMap::new();
        dict.insert("path".to_string(), Value::String(path));
        dict.insert("isdir".to_string(), Value::Int32(i32::from(is_dir)));
        // newest entry sits at the front; equal sort keys keep that order
        self.browse_list.insert(0, dict);
    }

    /// Attach a property to the most recently added browse entry.
    pub fn browse_add_entry_property(&mut self, key: &str, value: Value) {
        let Some(dict) = self.browse_list.first_mut() else {
            tracing::warn!("browse property '{}' set before any entry, ignoring", key);
            return;
        };
        dict.insert(key.to_string(), value);
    }

    pub fn browse_add_entry_property_str(&mut self, key: &str, value: &str) {
        self.browse_add_entry_property(key, Value::from(value));
    }

    pub fn browse_add_entry_property_int(&mut self, key: &str, value: i32) {
        self.browse_add_entry_property(key, Value::Int32(value));
    }

    /// Mark the current entry as a symlink whose real location is
    /// `link` with `args` appended as query arguments.
    pub fn browse_add_entry_symlink(&mut self, link: &str, args: &[&str]) {
        let mut realpath = url_encode(link);
        for (index, arg) in args.iter().enumerate() {
            realpath.push(if index == 0 { '?' } else { '&' });
            realpath.push_str(arg);
        }
        self.browse_add_entry_property("realpath", Value::String(realpath));
    }

    pub(crate) fn take_browse_list(&mut self) -> Vec<IndexMap<String, Value>> {
        std::mem::take(&mut self.browse_list)
    }
}

impl Stage {
    /// The synthetic chain head: no plugin, only an out-type advertising
    /// the starting URL.
    pub(crate) fn head(library: Arc<dyn MediaLibrary>, goal_hints: Arc<[StreamType]>) -> Self {
        Self { data: StageData::new(None, None, NO_ENTRY, goal_hints, library), xform: None }
    }

    /// Instantiate `plugin` on top of `prev`. For chains with a real
    /// entry the instance's `init` runs and must set the out-type; browse
    /// chains (`entry == 0`) skip initialization, mirroring that their
    /// instances are only ever asked to browse.
    pub(crate) fn new(
        plugin: &Arc<XformPlugin>,
        prev: Self,
        entry: Entry,
        goal_hints: Arc<[StreamType]>,
    ) -> std::result::Result<Self, InitFailure> {
        let library = prev.data.library.clone();
        let mut data =
            StageData::new(Some(Box::new(prev)), Some(plugin.clone()), entry, goal_hints, library);
        let mut instance = plugin.instantiate();

        if entry != NO_ENTRY {
            if let Err(error) = instance.init(&mut data) {
                return Err(InitFailure { error, prev: data.prev.take() });
            }
            if data.out_type.is_none() {
                let error = ChimeError::ProtocolViolation(format!(
                    "plugin '{}' did not set an output stream type",
                    plugin.shortname()
                ));
                return Err(InitFailure { error, prev: data.prev.take() });
            }
        }

        Ok(Self { data, xform: Some(instance) })
    }

    pub const fn out_type(&self) -> Option<&StreamType> {
        self.data.out_type.as_ref()
    }

    pub const fn entry(&self) -> Entry {
        self.data.entry
    }

    pub fn shortname(&self) -> &str {
        self.data.shortname()
    }

    pub const fn is_eos(&self) -> bool {
        self.data.eos
    }

    pub const fn errored(&self) -> bool {
        self.data.error
    }

    /// Chain-wide metadata lookup from the tail toward the source.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.data.metadata_get_str(key)
    }

    pub fn metadata_int(&self, key: &str) -> Option<i32> {
        self.data.metadata_get_int(key)
    }

    fn grow_buffer_for(&mut self, extra: usize) {
        while self.data.buffered + extra > self.data.buffer.len() {
            let doubled = self.data.buffer.len() * 2;
            self.data.buffer.resize(doubled, 0);
        }
    }

    /// Invoke the plugin's read with sticky-error and contract handling.
    fn call_plugin_read(&mut self, buf: &mut [u8], flush_metadata: bool) -> Result<usize> {
        let Self { data, xform } = self;
        let Some(instance) = xform.as_mut() else {
            data.error = true;
            return Err(ChimeError::ProtocolViolation(
                "read on a chain head with no plugin".to_string(),
            ));
        };

        let res = instance.read(data, buf);

        if flush_metadata && data.metadata_collected && data.metadata_changed {
            data.metadata_update();
        }

        match res {
            Ok(n) if n > buf.len() => {
                tracing::debug!(
                    "Read method of {} claimed {} bytes for a {} byte buffer - BUG IN PLUGIN",
                    data.shortname(),
                    n,
                    buf.len()
                );
                data.error = true;
                Err(ChimeError::ProtocolViolation(format!(
                    "plugin '{}' overran its read buffer",
                    data.shortname()
                )))
            }
            Ok(n) => Ok(n),
            Err(error) => {
                data.error = true;
                Err(error)
            }
        }
    }

    /// Fill the internal buffer to at least `buf.len()` bytes (or end of
    /// stream) and copy out without consuming.
    pub fn peek(&mut self, buf: &mut [u8]) -> Result<usize> {
        while self.data.buffered < buf.len() {
            self.grow_buffer_for(READ_CHUNK);

            let mut chunk = [0u8; READ_CHUNK];
            let got = self.call_plugin_read(&mut chunk, false)?;

            if got == 0 {
                self.data.eos = true;
                break;
            }
            let buffered = self.data.buffered;
            self.data.buffer[buffered..buffered + got].copy_from_slice(&chunk[..got]);
            self.data.buffered += got;
        }

        // might have hit end of stream short of the request
        let copied = buf.len().min(self.data.buffered);
        buf[..copied].copy_from_slice(&self.data.buffer[..copied]);
        Ok(copied)
    }

    /// Consume up to `buf.len()` bytes of this stage's output.
    ///
    /// Never crosses a queued hotspot boundary: the request is clamped at
    /// the next pending hotspot, and fresh plugin bytes are parked in the
    /// internal buffer whenever hotspots are still queued afterwards.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.data.error {
            return Err(ChimeError::TransientIo("read on errored stage".to_string()));
        }

        let mut siz = buf.len();
        if let Some(next) = self.data.hotspots_update() {
            siz = siz.min(next);
        }

        let mut read = 0;
        if self.data.buffered > 0 {
            read = siz.min(self.data.buffered);
            buf[..read].copy_from_slice(&self.data.buffer[..read]);
            self.data.buffered -= read;

            // buffer edited, keep hotspot positions aligned; boundary
            // hotspots were popped above, so every remaining position is
            // at least `read`
            for hs in &mut self.data.hotspots {
                debug_assert!(hs.pos >= read);
                hs.pos = hs.pos.saturating_sub(read);
            }

            if self.data.buffered > 0 {
                let remaining = self.data.buffered;
                self.data.buffer.copy_within(read..read + remaining, 0);
            }
        }

        if self.data.eos {
            return Ok(read);
        }

        while read < siz {
            let got = self.call_plugin_read(&mut buf[read..siz], true)?;

            if got == 0 {
                self.data.eos = true;
                break;
            }

            if read == 0 {
                self.data.hotspots_update();
            }

            if !self.data.hotspots.is_empty() {
                // handing these bytes out now would cross the pending
                // hotspot; park them so the next read can clamp
                self.grow_buffer_for(got);
                let buffered = self.data.buffered;
                self.data.buffer[buffered..buffered + got].copy_from_slice(&buf[read..read + got]);
                self.data.buffered += got;
                break;
            }

            read += got;
        }

        Ok(read)
    }

    /// Reposition this stage's output. Discards the buffer and every
    /// queued hotspot on success; their positions would point into a
    /// stream that no longer exists.
    pub fn seek(&mut self, offset: i64, whence: SeekWhence) -> Result<u64> {
        if self.data.error {
            return Err(ChimeError::TransientIo("seek on errored stage".to_string()));
        }

        if !self.data.plugin.as_ref().is_some_and(|p| p.provides_seek()) {
            tracing::debug!("Seek not implemented in '{}'", self.data.shortname());
            return Err(ChimeError::Unseekable(self.data.shortname().to_string()));
        }

        let mut offset = offset;
        if self.data.buffered > 0 && whence == SeekWhence::Cur {
            offset -= i64::try_from(self.data.buffered).unwrap_or(i64::MAX);
        }

        let res = {
            let Self { data, xform } = self;
            let Some(instance) = xform.as_mut() else {
                return Err(ChimeError::Unseekable("chain head".to_string()));
            };
            instance.seek(data, offset, whence)
        };

        let pos = res?;
        self.data.eos = false;
        self.data.buffered = 0;
        self.data.hotspots.clear();
        Ok(pos)
    }

    /// Run the plugin's browse method and hand back the collected,
    /// unsorted entry dicts.
    pub(crate) fn run_browse(&mut self, url: &str) -> Result<Vec<IndexMap<String, Value>>> {
        {
            let Self { data, xform } = self;
            let Some(instance) = xform.as_mut() else {
                return Err(ChimeError::UnknownBrowseTarget(url.to_string()));
            };
            instance.browse(data, url)?;
        }
        Ok(self.data.take_browse_list())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use crate::plugin::Capabilities;
    use chime_core::MemoryLibrary;
    use std::sync::Mutex;

    /// One step of a scripted plugin's output.
    ///
    /// `Flush` ends the current read call, the way a real plugin returns
    /// a short read at a unit boundary. `Privdata` publishes a value and
    /// ends the call when bytes were already written, so the marker sits
    /// at the end of those bytes.
    pub(crate) enum Op {
        Bytes(Vec<u8>),
        Privdata(&'static str, &'static str),
        Flush,
        Fail,
    }

    /// A source plugin driven by an op script. Tracks its absolute
    /// position so CUR seeks can be verified.
    pub(crate) struct Script {
        ops: Arc<Mutex<VecDeque<Op>>>,
        reads: Arc<Mutex<u32>>,
        pos: u64,
    }

    impl Script {
        pub(crate) fn plugin(name: &'static str, ops: Vec<Op>) -> XformPlugin {
            let ops = Arc::new(Mutex::new(ops.into_iter().collect::<VecDeque<_>>()));
            let reads = Arc::new(Mutex::new(0));
            Self::plugin_with_counters(name, ops, reads)
        }

        pub(crate) fn plugin_with_counters(
            name: &'static str,
            ops: Arc<Mutex<VecDeque<Op>>>,
            reads: Arc<Mutex<u32>>,
        ) -> XformPlugin {
            XformPlugin::new(name, [], Capabilities { seek: true, browse: false }, move || {
                Box::new(Self { ops: ops.clone(), reads: reads.clone(), pos: 0 })
            })
        }
    }

    impl Transform for Script {
        fn init(&mut self, stage: &mut StageData) -> Result<()> {
            stage.set_out_type(StreamType::builder().mimetype("application/octet-stream").build());
            Ok(())
        }

        fn read(&mut self, stage: &mut StageData, buf: &mut [u8]) -> Result<usize> {
            *self.reads.lock().unwrap() += 1;
            let mut ops = self.ops.lock().unwrap();
            let mut written = 0;
            loop {
                match ops.front_mut() {
                    None => break,
                    Some(Op::Fail) => {
                        return Err(ChimeError::TransientIo("scripted failure".to_string()));
                    }
                    Some(Op::Flush) => {
                        ops.pop_front();
                        if written > 0 {
                            break;
                        }
                    }
                    Some(Op::Privdata(key, value)) => {
                        let (key, value) = (*key, *value);
                        ops.pop_front();
                        stage.privdata_set_str(key, value);
                        if written > 0 {
                            break;
                        }
                    }
                    Some(Op::Bytes(_)) if written == buf.len() => break,
                    Some(Op::Bytes(bytes)) => {
                        let n = bytes.len().min(buf.len() - written);
                        buf[written..written + n].copy_from_slice(&bytes[..n]);
                        written += n;
                        if n < bytes.len() {
                            bytes.drain(..n);
                        } else {
                            ops.pop_front();
                        }
                    }
                }
            }
            self.pos += u64::try_from(written).unwrap();
            Ok(written)
        }

        fn seek(&mut self, _stage: &mut StageData, offset: i64, whence: SeekWhence) -> Result<u64> {
            let base = match whence {
                SeekWhence::Set => 0,
                SeekWhence::Cur | SeekWhence::End => i64::try_from(self.pos).unwrap(),
            };
            self.pos = u64::try_from(base + offset)
                .map_err(|_| ChimeError::TransientIo("seek before start of stream".to_string()))?;
            Ok(self.pos)
        }
    }

    pub(crate) fn library() -> Arc<MemoryLibrary> {
        Arc::new(MemoryLibrary::new())
    }

    pub(crate) fn stage_over(plugin: &Arc<XformPlugin>, entry: Entry) -> Stage {
        let lib: Arc<dyn MediaLibrary> = library();
        let hints: Arc<[StreamType]> = Arc::from(Vec::new());
        let head = Stage::head(lib, hints.clone());
        Stage::new(plugin, head, entry, hints).map_err(|f| f.error).unwrap()
    }

    pub(crate) fn scripted_stage(name: &'static str, ops: Vec<Op>) -> Stage {
        stage_over(&Arc::new(Script::plugin(name, ops)), 7)
    }

    fn bytes(n: usize, start: u8) -> Vec<u8> {
        (0..n).map(|i| start.wrapping_add(u8::try_from(i % 251).unwrap())).collect()
    }

    #[test]
    fn test_peek_then_read_yields_identical_bytes() {
        let payload = bytes(64, 3);
        let mut a = scripted_stage("src", vec![Op::Bytes(payload.clone())]);
        let mut b = scripted_stage("src", vec![Op::Bytes(payload)]);

        let mut peeked = [0u8; 64];
        assert_eq!(a.peek(&mut peeked).unwrap(), 64);
        let mut read_after_peek = [0u8; 64];
        assert_eq!(a.read(&mut read_after_peek).unwrap(), 64);

        let mut read_direct = [0u8; 64];
        assert_eq!(b.read(&mut read_direct).unwrap(), 64);

        assert_eq!(peeked, read_after_peek);
        assert_eq!(read_after_peek, read_direct);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut stage = scripted_stage("src", vec![Op::Bytes(bytes(10, 0))]);
        let mut one = [0u8; 4];
        let mut two = [0u8; 4];
        assert_eq!(stage.peek(&mut one).unwrap(), 4);
        assert_eq!(stage.peek(&mut two).unwrap(), 4);
        assert_eq!(one, two);
    }

    #[test]
    fn test_peek_short_at_eos_then_read() {
        // 40 bytes then end of stream; a 100-byte peek returns 40 and
        // latches eos, and the following read returns the same 40
        let mut stage = scripted_stage("src", vec![Op::Bytes(bytes(40, 1))]);
        let mut buf = [0u8; 100];
        assert_eq!(stage.peek(&mut buf).unwrap(), 40);
        assert!(stage.is_eos());
        let mut out = [0u8; 100];
        assert_eq!(stage.read(&mut out).unwrap(), 40);
        assert_eq!(out[..40], buf[..40]);
        assert_eq!(stage.read(&mut out).unwrap(), 0);
    }

    #[test]
    fn test_hotspots_fire_at_exact_offsets() {
        // 10 bytes, frame=A, 10 bytes, frame=B, 10 bytes
        let mut stage = scripted_stage(
            "src",
            vec![
                Op::Bytes(bytes(10, 0)),
                Op::Privdata("frame", "A"),
                Op::Bytes(bytes(10, 50)),
                Op::Privdata("frame", "B"),
                Op::Bytes(bytes(10, 100)),
            ],
        );

        let mut buf = [0u8; 5];
        let expected = [None, Some("A"), Some("A"), Some("B"), Some("B")];
        for (i, want) in expected.iter().enumerate() {
            assert_eq!(stage.read(&mut buf).unwrap(), 5, "read {i}");
            assert_eq!(
                stage.data.privdata.get("frame").and_then(|v| v.as_str()),
                *want,
                "after read {i}"
            );
        }
        // one unit is still pending, then the stream ends
        assert_eq!(stage.read(&mut buf).unwrap(), 5);
        assert_eq!(stage.read(&mut buf).unwrap(), 0);
        assert!(stage.is_eos());
    }

    #[test]
    fn test_read_clamps_at_queued_hotspot() {
        // unit boundary first, marker published at the start of the next
        // call, so the queued hotspot carries the exact offset
        let mut stage = scripted_stage(
            "src",
            vec![
                Op::Bytes(bytes(10, 0)),
                Op::Flush,
                Op::Privdata("frame", "A"),
                Op::Bytes(bytes(10, 50)),
            ],
        );

        // buffer everything ahead of time; the hotspot lands at offset 10
        let mut all = [0u8; 20];
        assert_eq!(stage.peek(&mut all).unwrap(), 20);
        assert_eq!(stage.data.hotspots.front().map(|hs| hs.pos), Some(10));

        let mut buf = [0u8; 16];
        // the read must stop at the hotspot even though 20 bytes sit in
        // the buffer
        assert_eq!(stage.read(&mut buf).unwrap(), 10);
        assert_eq!(stage.data.privdata.get("frame"), None);
        assert_eq!(stage.read(&mut buf).unwrap(), 10);
        assert_eq!(stage.data.privdata.get("frame").and_then(|v| v.as_str()), Some("A"));
    }

    #[test]
    fn test_fresh_bytes_are_parked_behind_pending_hotspot() {
        // the plugin publishes a marker and then produces bytes within
        // the same read call while earlier bytes were already handed out;
        // those fresh bytes must not be returned past the marker
        let mut stage = scripted_stage(
            "src",
            vec![
                Op::Bytes(bytes(10, 0)),
                Op::Flush,
                Op::Privdata("frame", "A"),
                Op::Bytes(bytes(10, 50)),
            ],
        );

        let mut buf = [0u8; 16];
        // first call returns the 10-byte unit; the second call publishes
        // the marker and produces 6 more bytes, which get parked
        assert_eq!(stage.read(&mut buf).unwrap(), 10);
        assert_eq!(stage.data.privdata.get("frame"), None);
        assert_eq!(stage.data.buffered, 6);

        // next read drains the marker first, then the parked bytes
        assert_eq!(stage.read(&mut buf).unwrap(), 10);
        assert_eq!(stage.data.privdata.get("frame").and_then(|v| v.as_str()), Some("A"));
    }

    #[test]
    fn test_hotspot_positions_stay_sorted() {
        let mut stage = scripted_stage(
            "src",
            vec![
                Op::Bytes(bytes(8, 0)),
                Op::Flush,
                Op::Privdata("a", "1"),
                Op::Bytes(bytes(8, 8)),
                Op::Flush,
                Op::Privdata("b", "2"),
                Op::Bytes(bytes(8, 16)),
            ],
        );
        let mut buf = [0u8; 24];
        assert_eq!(stage.peek(&mut buf).unwrap(), 24);

        let positions: Vec<_> = stage.data.hotspots.iter().map(|hs| hs.pos).collect();
        assert_eq!(positions, [8, 16]);

        let _ = stage.read(&mut buf[..3]).unwrap();
        let positions: Vec<_> = stage.data.hotspots.iter().map(|hs| hs.pos).collect();
        assert_eq!(positions, [5, 13]);
    }

    #[test]
    fn test_errored_stage_is_sticky_and_skips_plugin() {
        let ops = Arc::new(Mutex::new(VecDeque::from([Op::Fail])));
        let reads = Arc::new(Mutex::new(0u32));
        let plugin = Arc::new(Script::plugin_with_counters("src", ops, reads.clone()));
        let mut stage = stage_over(&plugin, 7);

        let mut buf = [0u8; 1];
        assert!(matches!(stage.read(&mut buf), Err(ChimeError::TransientIo(_))));
        assert!(stage.errored());
        assert_eq!(*reads.lock().unwrap(), 1);

        // sticky: the plugin is not called again
        assert!(matches!(stage.read(&mut buf), Err(ChimeError::TransientIo(_))));
        assert_eq!(*reads.lock().unwrap(), 1);
    }

    #[test]
    fn test_seek_discards_buffer_and_hotspots() {
        let mut stage = scripted_stage(
            "src",
            vec![
                Op::Bytes(bytes(10, 0)),
                Op::Flush,
                Op::Privdata("a", "1"),
                Op::Bytes(bytes(10, 0)),
                Op::Flush,
                Op::Privdata("b", "2"),
                Op::Bytes(bytes(10, 0)),
                Op::Flush,
                Op::Privdata("c", "3"),
            ],
        );

        // buffer 30 bytes and latch eos
        let mut buf = [0u8; 40];
        assert_eq!(stage.peek(&mut buf).unwrap(), 30);
        assert!(stage.is_eos());
        assert_eq!(stage.data.hotspots.len(), 3);

        assert_eq!(stage.seek(0, SeekWhence::Set).unwrap(), 0);
        assert!(!stage.is_eos());
        assert_eq!(stage.data.buffered, 0);
        assert!(stage.data.hotspots.is_empty());
    }

    #[test]
    fn test_cur_seek_accounts_for_buffered_bytes() {
        let mut stage = scripted_stage("src", vec![Op::Bytes(bytes(100, 0))]);

        let mut buf = [0u8; 7];
        assert_eq!(stage.read(&mut buf).unwrap(), 7);
        // buffer ahead without consuming
        let mut ahead = [0u8; 20];
        assert_eq!(stage.peek(&mut ahead).unwrap(), 20);

        // logical position is still 7
        assert_eq!(stage.seek(0, SeekWhence::Cur).unwrap(), 7);
    }

    #[test]
    fn test_seek_without_capability_fails() {
        struct NoSeek;
        impl Transform for NoSeek {
            fn init(&mut self, stage: &mut StageData) -> Result<()> {
                stage.set_out_type(StreamType::builder().mimetype("audio/pcm").build());
                Ok(())
            }
            fn read(&mut self, _stage: &mut StageData, _buf: &mut [u8]) -> Result<usize> {
                Ok(0)
            }
        }
        let plugin =
            Arc::new(XformPlugin::new("noseek", [], Capabilities::default(), || Box::new(NoSeek)));
        let mut stage = stage_over(&plugin, 7);

        assert!(matches!(stage.seek(0, SeekWhence::Set), Err(ChimeError::Unseekable(_))));
        // and the failure is not sticky
        assert!(!stage.errored());
    }

    #[test]
    fn test_plugin_overrun_is_a_contract_violation() {
        struct Overrun;
        impl Transform for Overrun {
            fn init(&mut self, stage: &mut StageData) -> Result<()> {
                stage.set_out_type(StreamType::builder().mimetype("audio/pcm").build());
                Ok(())
            }
            fn read(&mut self, _stage: &mut StageData, buf: &mut [u8]) -> Result<usize> {
                Ok(buf.len() + 1)
            }
        }
        let plugin =
            Arc::new(XformPlugin::new("bad", [], Capabilities::default(), || Box::new(Overrun)));
        let mut stage = stage_over(&plugin, 7);

        let mut buf = [0u8; 8];
        assert!(matches!(stage.read(&mut buf), Err(ChimeError::ProtocolViolation(_))));
        assert!(stage.errored());
    }

    #[test]
    fn test_buffer_grows_by_doubling() {
        let payload = bytes(3 * READ_CHUNK, 9);
        let mut stage = scripted_stage("src", vec![Op::Bytes(payload.clone())]);
        let mut buf = vec![0u8; 3 * READ_CHUNK];
        assert_eq!(stage.peek(&mut buf).unwrap(), 3 * READ_CHUNK);
        assert_eq!(buf, payload);
    }

    // --- downstream stage view ------------------------------------------

    struct Passthrough;
    impl Transform for Passthrough {
        fn init(&mut self, stage: &mut StageData) -> Result<()> {
            stage.copy_out_type_from_prev();
            Ok(())
        }
        fn read(&mut self, stage: &mut StageData, buf: &mut [u8]) -> Result<usize> {
            stage.read(buf)
        }
    }

    pub(crate) fn passthrough_plugin(name: &'static str) -> XformPlugin {
        XformPlugin::new(
            name,
            [StreamType::builder().mimetype("application/octet-stream").build()],
            Capabilities::default(),
            || Box::new(Passthrough),
        )
    }

    fn chained(source_ops: Vec<Op>) -> Stage {
        let lib: Arc<dyn MediaLibrary> = library();
        let hints: Arc<[StreamType]> = Arc::from(Vec::new());
        let head = Stage::head(lib, hints.clone());
        let source = Arc::new(Script::plugin("src", source_ops));
        let source_stage = Stage::new(&source, head, 7, hints.clone()).map_err(|f| f.error).unwrap();
        let pass = Arc::new(passthrough_plugin("pass"));
        Stage::new(&pass, source_stage, 7, hints).map_err(|f| f.error).unwrap()
    }

    #[test]
    fn test_privdata_visible_to_downstream_stage() {
        let mut sink = chained(vec![
            Op::Bytes(bytes(10, 0)),
            Op::Privdata("frame", "A"),
            Op::Bytes(bytes(10, 50)),
        ]);

        let mut buf = [0u8; 10];
        assert_eq!(sink.read(&mut buf).unwrap(), 10);
        assert_eq!(sink.data.privdata_get_str("frame"), Some("A"));
        assert!(sink.data.privdata_has("frame"));
        assert_eq!(sink.data.privdata_get_int("frame"), None);
    }

    #[test]
    fn test_privdata_set_str_dedupes_unchanged_value() {
        let mut stage = scripted_stage("src", vec![]);
        stage.data.privdata_set_str("k", "v");
        assert_eq!(stage.data.hotspots.len(), 1);
        stage.data.privdata_set_str("k", "v");
        assert_eq!(stage.data.hotspots.len(), 1);
        stage.data.privdata_set_str("k", "w");
        assert_eq!(stage.data.hotspots.len(), 2);
    }

    // --- metadata -------------------------------------------------------

    #[test]
    fn test_metadata_str_dedupe_leaves_changed_clear() {
        let mut stage = scripted_stage("src", vec![]);
        stage.data.metadata_set_str("title", "Song");
        assert!(stage.data.metadata_changed);
        stage.data.metadata_changed = false;

        stage.data.metadata_set_str("title", "Song");
        assert!(!stage.data.metadata_changed);

        stage.data.metadata_set_str("title", "Other");
        assert!(stage.data.metadata_changed);
    }

    #[test]
    fn test_metadata_lookup_walks_toward_source() {
        let lib: Arc<dyn MediaLibrary> = library();
        let hints: Arc<[StreamType]> = Arc::from(Vec::new());
        let head = Stage::head(lib, hints.clone());
        let source = Arc::new(Script::plugin("src", vec![]));
        let mut source_stage =
            Stage::new(&source, head, 7, hints.clone()).map_err(|f| f.error).unwrap();
        source_stage.data.metadata_set_str("artist", "Someone");

        let pass = Arc::new(passthrough_plugin("pass"));
        let sink = Stage::new(&pass, source_stage, 7, hints).map_err(|f| f.error).unwrap();

        assert_eq!(sink.data.metadata_get_str("artist"), Some("Someone"));
        assert_eq!(sink.metadata_str("artist"), Some("Someone"));
        assert!(sink.data.metadata_has("artist"));
        assert_eq!(sink.data.metadata_get_str("absent"), None);
    }

    // --- line reader ----------------------------------------------------

    fn line_stage(text: &str) -> Stage {
        chained(vec![Op::Bytes(text.as_bytes().to_vec())])
    }

    #[test]
    fn test_read_line_strips_lf_and_crlf() {
        let mut stage = line_stage("alpha\r\nbeta\ngamma");
        assert_eq!(stage.data.read_line().unwrap().as_deref(), Some("alpha"));
        assert_eq!(stage.data.read_line().unwrap().as_deref(), Some("beta"));
        // final unterminated line still comes out
        assert_eq!(stage.data.read_line().unwrap().as_deref(), Some("gamma"));
        assert_eq!(stage.data.read_line().unwrap(), None);
    }

    #[test]
    fn test_read_line_keeps_lone_cr() {
        let mut stage = line_stage("a\rb\nrest\n");
        assert_eq!(stage.data.read_line().unwrap().as_deref(), Some("a\rb"));
        assert_eq!(stage.data.read_line().unwrap().as_deref(), Some("rest"));
        assert_eq!(stage.data.read_line().unwrap(), None);
    }

    #[test]
    fn test_read_line_oversized_line_is_split() {
        let long = "x".repeat(MAX_LINE_SIZE + 100);
        let text = format!("{long}\nshort\n");
        let mut stage = line_stage(&text);

        let first = stage.data.read_line().unwrap().unwrap();
        assert_eq!(first.len(), MAX_LINE_SIZE - 1);
        // the rest of the oversized line comes out next
        let second = stage.data.read_line().unwrap().unwrap();
        assert_eq!(second.len(), 101);
        assert_eq!(stage.data.read_line().unwrap().as_deref(), Some("short"));
        assert_eq!(stage.data.read_line().unwrap(), None);
    }

    #[test]
    fn test_read_line_empty_stream() {
        let mut stage = line_stage("");
        assert_eq!(stage.data.read_line().unwrap(), None);
    }
}

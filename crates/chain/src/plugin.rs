// SPDX-FileCopyrightText: © 2025 Chime Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Transform plugins and their registry.
//!
//! This module defines the seam between the chain and the code that
//! actually reads, demuxes, decodes, or filters bytes:
//! - [`Transform`]: The per-instance method set a plugin implements
//! - [`XformPlugin`]: Plugin descriptor (shortname, accepted inputs,
//!   capabilities, instance factory)
//! - [`PluginRegistry`]: Ordered registry the chain builder scans
//!
//! A plugin with no accepted input types is a *source*: it is never
//! auto-matched during chain assembly and only ends up in a chain when a
//! URL handler explicitly resolves to it.

use std::sync::Arc;

use chime_core::{ChimeError, Result, StreamType};
use smallvec::SmallVec;

use crate::stage::StageData;

/// Seek origins, identical to standard file seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Cur,
    End,
}

/// The method set of one plugin instance.
///
/// Absent capabilities keep their default bodies; the matching
/// capability flag on the descriptor tells the stage whether the default
/// is all there is, so a seek on an unseekable plugin fails before any
/// state is touched. Cleanup happens in `Drop` as usual.
pub trait Transform: Send {
    /// Called once, right after the stage is created, for chains with a
    /// real media-library entry. Must set the stage's output stream type
    /// via [`StageData::set_out_type`] (or copy it from upstream).
    fn init(&mut self, stage: &mut StageData) -> Result<()>;

    /// Produce up to `buf.len()` bytes. `Ok(0)` means end of stream.
    ///
    /// The instance may pull from upstream through `stage` and may set
    /// metadata and private data on its own stage while doing so.
    fn read(&mut self, stage: &mut StageData, buf: &mut [u8]) -> Result<usize>;

    /// Reposition the stream. Only called when the descriptor declares
    /// the seek capability.
    fn seek(&mut self, stage: &mut StageData, offset: i64, whence: SeekWhence) -> Result<u64> {
        let _ = (stage, offset, whence);
        Err(ChimeError::Unseekable("seek not implemented".to_string()))
    }

    /// Enumerate the children of `url` via
    /// [`StageData::browse_add_entry`]. Only called when the descriptor
    /// declares the browse capability.
    fn browse(&mut self, stage: &mut StageData, url: &str) -> Result<()> {
        let _ = stage;
        Err(ChimeError::UnknownBrowseTarget(url.to_string()))
    }
}

/// Optional capabilities of a plugin, declared up front.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub seek: bool,
    pub browse: bool,
}

/// Factory producing fresh plugin instances, one per stage.
pub type TransformFactory = Arc<dyn Fn() -> Box<dyn Transform> + Send + Sync>;

/// A plugin descriptor. Shared immutably between the registry and every
/// stage instantiated from it.
pub struct XformPlugin {
    shortname: String,
    in_types: SmallVec<[StreamType; 2]>,
    caps: Capabilities,
    factory: TransformFactory,
}

impl XformPlugin {
    pub fn new<F>(
        shortname: impl Into<String>,
        in_types: impl IntoIterator<Item = StreamType>,
        caps: Capabilities,
        factory: F,
    ) -> Self
    where
        F: Fn() -> Box<dyn Transform> + Send + Sync + 'static,
    {
        Self {
            shortname: shortname.into(),
            in_types: in_types.into_iter().collect(),
            caps,
            factory: Arc::new(factory),
        }
    }

    pub fn shortname(&self) -> &str {
        &self.shortname
    }

    pub fn in_types(&self) -> &[StreamType] {
        &self.in_types
    }

    /// A source has no accepted inputs and is never auto-matched.
    pub fn is_source(&self) -> bool {
        self.in_types.is_empty()
    }

    /// Does any accepted input pattern match `out`?
    pub fn supports(&self, out: &StreamType) -> bool {
        self.in_types.iter().any(|t| t.matches(out))
    }

    pub const fn provides_seek(&self) -> bool {
        self.caps.seek
    }

    pub const fn provides_browse(&self) -> bool {
        self.caps.browse
    }

    pub(crate) fn instantiate(&self) -> Box<dyn Transform> {
        (self.factory)()
    }
}

impl std::fmt::Debug for XformPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XformPlugin")
            .field("shortname", &self.shortname)
            .field("in_types", &self.in_types)
            .field("caps", &self.caps)
            .finish_non_exhaustive()
    }
}

/// Ordered registry of transform plugins.
///
/// Registration order matters: the chain builder takes the first plugin
/// whose accepted inputs match, so more specific handlers should be
/// registered before catch-alls.
#[derive(Debug, Default, Clone)]
pub struct PluginRegistry {
    plugins: Vec<Arc<XformPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: XformPlugin) -> Arc<XformPlugin> {
        tracing::debug!("Registering xform '{}'", plugin.shortname());
        let plugin = Arc::new(plugin);
        self.plugins.push(plugin.clone());
        plugin
    }

    pub fn find_by_name(&self, shortname: &str) -> Option<Arc<XformPlugin>> {
        self.plugins.iter().find(|p| p.shortname() == shortname).cloned()
    }

    pub fn contains(&self, shortname: &str) -> bool {
        self.plugins.iter().any(|p| p.shortname() == shortname)
    }

    /// All plugins in registration order.
    pub fn plugins(&self) -> impl Iterator<Item = &Arc<XformPlugin>> {
        self.plugins.iter()
    }
}

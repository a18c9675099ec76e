// SPDX-FileCopyrightText: © 2025 Chime Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Chime Chain - the transform chain at the heart of the chime media
//! daemon.
//!
//! A chain resolves an opaque media URL into a decoded stream by linking
//! pluggable stages (source readers, demuxers, decoders, effects)
//! through a typed stream-format handshake, then serves the consumer
//! through a buffered pull protocol with an exact byte-position side
//! channel.
//!
//! ## Core Modules
//!
//! - [`plugin`]: The [`Transform`] trait, plugin descriptors, and the
//!   registry
//! - [`stage`]: One chain node: buffered peek/read/seek, hotspots,
//!   metadata, private data, line reading
//! - [`builder`]: Format-directed chain assembly and effect insertion
//! - [`browse`]: Directory-like enumeration of container/remote URLs
//! - [`plugins`]: Built-in plugins (`file`)
//!
//! ## Quick Start
//!
//! ```ignore
//! use chime_chain::{ChainBuilder, PluginRegistry, pcm_goal};
//! use chime_core::{ConfigStore, MemoryLibrary, SampleFormat};
//! use std::sync::Arc;
//!
//! let mut registry = PluginRegistry::new();
//! chime_chain::plugins::register_builtins(&mut registry);
//! // ... register demuxers, decoders, effects ...
//!
//! let library = Arc::new(MemoryLibrary::new());
//! let entry = library.add_entry("file:///music/song.ogg");
//!
//! let builder = ChainBuilder::new(
//!     Arc::new(registry),
//!     library,
//!     Arc::new(ConfigStore::new()),
//! );
//! let mut chain = builder.build_for_entry(
//!     entry,
//!     &[pcm_goal(SampleFormat::S16, 44100, 2)],
//! )?;
//!
//! let mut buf = [0u8; 4096];
//! while chain.read(&mut buf)? > 0 { /* feed the output */ }
//! ```

// Module declarations
pub mod browse;
pub mod builder;
mod collect;
pub mod plugin;
pub mod plugins;
pub mod stage;

// Convenience re-exports for commonly used types

// Chain assembly
pub use builder::{pcm_goal, ChainBuilder};

// Browsing
pub use browse::browse;

// Plugin surface
pub use plugin::{Capabilities, PluginRegistry, SeekWhence, Transform, XformPlugin};

// Stages
pub use stage::{Stage, StageData, MAX_LINE_SIZE, READ_CHUNK};

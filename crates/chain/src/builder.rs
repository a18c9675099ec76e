// SPDX-FileCopyrightText: © 2025 Chime Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Chain assembly.
//!
//! [`ChainBuilder`] turns a media-library entry (or a raw URL) plus a
//! list of goal formats into a linked chain of stages: it parses query
//! arguments into head metadata, then repeatedly picks the first
//! registered plugin whose accepted inputs match the tail's output until
//! the output satisfies a goal format. Configured effects are stacked on
//! top, and finalization runs the metadata collector.

use std::sync::Arc;

use chime_core::medialib::{properties, Entry, MediaLibrary, NO_ENTRY};
use chime_core::{url_decode, ChimeError, ConfigStore, Result, SampleFormat, StreamType};

use crate::collect;
use crate::plugin::{PluginRegistry, XformPlugin};
use crate::stage::Stage;

/// Builds transform chains against one registry, library, and
/// configuration store.
pub struct ChainBuilder {
    registry: Arc<PluginRegistry>,
    library: Arc<dyn MediaLibrary>,
    config: Arc<ConfigStore>,
}

/// First registered non-source plugin accepting `out`.
pub(crate) fn find_plugin(
    registry: &PluginRegistry,
    out: &StreamType,
) -> Option<Arc<XformPlugin>> {
    for plugin in registry.plugins() {
        if plugin.is_source() {
            tracing::debug!("Skipping plugin '{}'", plugin.shortname());
            continue;
        }
        tracing::debug!("Trying plugin '{}'", plugin.shortname());
        if plugin.supports(out) {
            tracing::debug!("Plugin '{}' matched", plugin.shortname());
            return Some(plugin.clone());
        }
    }
    None
}

fn has_goal_format(stage: &Stage, goals: &[StreamType]) -> bool {
    let Some(out) = stage.out_type() else {
        return false;
    };
    if goals.iter().any(|goal| goal.matches(out)) {
        return true;
    }
    tracing::debug!("Not in one of {} goal-types", goals.len());
    false
}

/// Populate PCM format metadata on the tail once the chain ends in raw
/// audio.
fn out_type_metadata_collect(stage: &mut Stage) {
    let Some(out) = stage.data.out_type.clone() else {
        return;
    };
    if out.mimetype() != Some("audio/pcm") {
        return;
    }

    if let Some(format) = out.format() {
        stage.data.metadata_set_str(properties::SAMPLE_FORMAT, format.name());
    }
    if let Some(samplerate) = out.samplerate() {
        stage.data.metadata_set_int(properties::SAMPLERATE, samplerate);
    }
    if let Some(channels) = out.channels() {
        stage.data.metadata_set_int(properties::CHANNELS, channels);
    }
}

impl ChainBuilder {
    pub fn new(
        registry: Arc<PluginRegistry>,
        library: Arc<dyn MediaLibrary>,
        config: Arc<ConfigStore>,
    ) -> Self {
        Self { registry, library, config }
    }

    /// Build a chain for a library entry, effects included.
    pub fn build_for_entry(&self, entry: Entry, goals: &[StreamType]) -> Result<Stage> {
        let url = self.entry_url(entry)?;
        let goals: Arc<[StreamType]> = goals.into();
        let last = self.setup(entry, &url, &goals)?;
        let mut last = self.add_effects(last, entry, &goals);
        self.finalize(&mut last, entry, &url);
        Ok(last)
    }

    /// Build a chain for a library entry, skipping configured effects.
    pub fn build_for_entry_without_effects(&self, entry: Entry, goals: &[StreamType]) -> Result<Stage> {
        let url = self.entry_url(entry)?;
        let goals: Arc<[StreamType]> = goals.into();
        let mut last = self.setup(entry, &url, &goals)?;
        self.finalize(&mut last, entry, &url);
        Ok(last)
    }

    /// Build a chain for an explicit URL, effects included.
    pub fn build_for_url(&self, entry: Entry, url: &str, goals: &[StreamType]) -> Result<Stage> {
        let goals: Arc<[StreamType]> = goals.into();
        let last = self.setup(entry, url, &goals)?;
        let mut last = self.add_effects(last, entry, &goals);
        self.finalize(&mut last, entry, url);
        Ok(last)
    }

    /// Build a chain for an explicit URL, skipping configured effects.
    pub fn build_for_url_without_effects(
        &self,
        entry: Entry,
        url: &str,
        goals: &[StreamType],
    ) -> Result<Stage> {
        let goals: Arc<[StreamType]> = goals.into();
        let mut last = self.setup(entry, url, &goals)?;
        self.finalize(&mut last, entry, url);
        Ok(last)
    }

    fn entry_url(&self, entry: Entry) -> Result<String> {
        let session = self.library.begin();
        let url = session.property_get_str(entry, properties::URL);
        url.ok_or_else(|| {
            tracing::error!("Couldn't get url for entry ({})", entry);
            ChimeError::Configuration(format!("no url for entry {entry}"))
        })
    }

    /// Head stage plus the format-directed find loop.
    fn setup(&self, entry: Entry, url: &str, goals: &Arc<[StreamType]>) -> Result<Stage> {
        let mut head = Stage::head(self.library.clone(), goals.clone());

        // query arguments come off before decoding and land as head
        // metadata: `?a=b&c` → a="b", c=1
        let mut durl = url.to_string();
        if let Some(pos) = durl.find('?') {
            let args = durl.split_off(pos);
            let args = url_decode(&args[1..]).unwrap_or_else(|| args[1..].to_string());
            for param in args.split('&').filter(|p| !p.is_empty()) {
                match param.split_once('=') {
                    Some((key, value)) => head.data.metadata_set_str(key, value),
                    None => head.data.metadata_set_int(param, 1),
                }
            }
        }
        let durl = url_decode(&durl).unwrap_or(durl);

        head.data.set_out_type(
            StreamType::builder().mimetype("application/x-url").url(&durl).build(),
        );

        let mut last = head;
        loop {
            let Some(out) = last.out_type() else {
                return Err(ChimeError::ProtocolViolation(format!(
                    "stage '{}' lost its output stream type",
                    last.shortname()
                )));
            };
            let Some(plugin) = find_plugin(&self.registry, out) else {
                tracing::error!("Couldn't set up chain for '{}' ({})", url, entry);
                return Err(ChimeError::NoMatchingPlugin(format!("no plugin chain for '{url}'")));
            };

            last = Stage::new(&plugin, last, entry, goals.clone()).map_err(|f| f.error)?;

            if has_goal_format(&last, goals) {
                break;
            }
        }

        out_type_metadata_collect(&mut last);

        Ok(last)
    }

    /// Stack configured effects on top of `last`.
    ///
    /// `effect.order.N` keys are walked in order; a missing key is
    /// registered empty (so clients can discover the slot) and ends the
    /// walk, as does an empty name. Unknown effects and effects that do
    /// not accept the current format are skipped; only effects that pass
    /// the format check get their `enabled` property registered.
    fn add_effects(&self, mut last: Stage, entry: Entry, goals: &Arc<[StreamType]>) -> Stage {
        for effect_no in 0.. {
            let key = format!("effect.order.{effect_no}");
            let Some(name) = self.config.lookup(&key) else {
                self.config.register(&key, "");
                break;
            };
            if name.is_empty() {
                break;
            }

            let Some(plugin) = self.registry.find_by_name(&name) else {
                tracing::error!("Couldn't find any effect named '{}'", name);
                continue;
            };

            let supported = last.out_type().is_some_and(|out| plugin.supports(out));
            if !supported {
                tracing::info!(
                    "Skipping effect '{}' that doesn't support format",
                    plugin.shortname()
                );
                continue;
            }

            match Stage::new(&plugin, last, entry, goals.clone()) {
                Ok(stage) => last = stage,
                Err(failure) => {
                    tracing::error!(
                        "Effect '{}' failed to initialize: {}",
                        plugin.shortname(),
                        failure.error
                    );
                    match failure.prev {
                        Some(prev) => last = *prev,
                        // cannot happen: construction always links prev
                        None => unreachable!("stage init failure lost its upstream chain"),
                    }
                }
            }

            self.config.register(&format!("{}.enabled", plugin.shortname()), "0");
        }
        last
    }

    /// Collect metadata and log the finished chain. Chains without a
    /// real entry (browse, probes) never touch the library.
    fn finalize(&self, tail: &mut Stage, entry: Entry, url: &str) {
        if entry == NO_ENTRY {
            return;
        }
        let name = collect::collect_chain(tail);
        tracing::info!("Successfully setup chain for '{}' ({}) containing {}", url, entry, name);
    }
}

/// The usual goal format of a playback chain: raw PCM at a fixed rate
/// and channel count.
pub fn pcm_goal(format: SampleFormat, samplerate: i32, channels: i32) -> StreamType {
    StreamType::builder()
        .mimetype("audio/pcm")
        .format(format)
        .samplerate(samplerate)
        .channels(channels)
        .build()
}

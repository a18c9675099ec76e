// SPDX-FileCopyrightText: © 2025 Chime Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Browse mode: directory-like enumeration of container and remote URLs.
//!
//! Browsing reuses the plugin dispatch of chain assembly with a one-shot
//! chain: a synthetic head advertising the URL, one matching plugin, no
//! entry, no goal formats. The plugin's browse method fills the entry
//! list, which comes back sorted: numerically when every compared pair
//! carries an `intsort` property, by `path` code-point order otherwise,
//! stable in insertion order.

use std::cmp::Ordering;
use std::sync::Arc;

use chime_core::medialib::{MediaLibrary, NO_ENTRY};
use chime_core::{url_decode, ChimeError, Result, StreamType, Value};
use indexmap::IndexMap;

use crate::builder::find_plugin;
use crate::plugin::PluginRegistry;
use crate::stage::Stage;

fn entry_order(a: &IndexMap<String, Value>, b: &IndexMap<String, Value>) -> Ordering {
    if let (Some(Value::Int32(x)), Some(Value::Int32(y))) = (a.get("intsort"), b.get("intsort")) {
        return x.cmp(y);
    }
    match (a.get("path"), b.get("path")) {
        (Some(Value::String(p)), Some(Value::String(q))) => p.cmp(q),
        _ => Ordering::Equal,
    }
}

/// Enumerate the children of `url`.
///
/// Returns one [`Value::Dict`] per entry with at least `path` and
/// `isdir`, plus whatever the plugin added.
///
/// # Errors
///
/// [`ChimeError::UnknownBrowseTarget`] when no registered plugin matches
/// the URL or the matching plugin cannot browse; plugin errors pass
/// through.
pub fn browse(
    registry: &PluginRegistry,
    library: &Arc<dyn MediaLibrary>,
    url: &str,
) -> Result<Vec<Value>> {
    let durl = url_decode(url).unwrap_or_else(|| url.to_string());
    tracing::debug!("url = {}", durl);

    let goal_hints: Arc<[StreamType]> = Arc::from(Vec::new());
    let mut head = Stage::head(library.clone(), goal_hints.clone());
    head.data
        .set_out_type(StreamType::builder().mimetype("application/x-url").url(&durl).build());

    let Some(out) = head.out_type() else {
        return Err(ChimeError::UnknownBrowseTarget(url.to_string()));
    };
    let Some(plugin) = find_plugin(registry, out) else {
        return Err(ChimeError::UnknownBrowseTarget("Couldn't handle that URL".to_string()));
    };
    tracing::debug!("found xform {}", plugin.shortname());

    if !plugin.provides_browse() {
        return Err(ChimeError::UnknownBrowseTarget("Couldn't handle that URL".to_string()));
    }

    // one-shot chain: no entry, init skipped, only browse runs
    let mut stage =
        Stage::new(&plugin, head, NO_ENTRY, goal_hints).map_err(|failure| failure.error)?;

    let mut list = stage.run_browse(&durl)?;
    list.sort_by(entry_order);

    Ok(list.into_iter().map(Value::Dict).collect())
}

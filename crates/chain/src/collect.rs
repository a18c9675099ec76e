// SPDX-FileCopyrightText: © 2025 Chime Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Metadata collection: flushing per-stage metadata into the media
//! library.
//!
//! The full pass runs once per finished chain, source-first: it builds
//! the colon-separated chain name, writes every changed stage's metadata
//! under its `plugin/<shortname>` source, bumps the play counter, and
//! stamps the start time. The single-stage path reuses the same
//! write-through and is what the in-flight flush during `read` calls.

use std::time::{SystemTime, UNIX_EPOCH};

use chime_core::medialib::{properties, EntryStatus, MediaSession};
use chime_core::Value;

use crate::stage::{Stage, StageData};

fn unix_now() -> i32 {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
    i32::try_from(secs).unwrap_or(i32::MAX)
}

/// Write one stage's metadata through the session under its plugin
/// source and clear the changed flag.
pub(crate) fn collect_one(data: &mut StageData, session: &mut dyn MediaSession) {
    tracing::debug!("Collecting metadata from {}", data.shortname());
    let source = session.source_to_id(&format!("plugin/{}", data.shortname()));
    for (key, value) in &data.metadata {
        match value {
            Value::String(s) => {
                session.property_set_str_source(data.entry(), key, s, source);
            }
            Value::Int32(v) => {
                session.property_set_int_source(data.entry(), key, *v, source);
            }
            other => {
                tracing::debug!("Unhandled metadata value type for '{}': {:?}", key, other);
            }
        }
    }
    data.metadata_changed = false;
}

fn collect_recursive(stage: &mut Stage, session: &mut dyn MediaSession, name: &mut String) {
    if let Some(prev) = stage.data.prev.as_mut() {
        collect_recursive(prev, session, name);
    }

    if stage.data.plugin.is_some() {
        if !name.is_empty() {
            name.push(':');
        }
        name.push_str(stage.shortname());
    }
    if stage.data.metadata_changed {
        collect_one(&mut stage.data, session);
    }
    stage.data.metadata_collected = true;
}

/// Walk the finished chain source-first, persist all metadata, update
/// play counters, and notify. Returns the chain name
/// (colon-separated shortnames).
pub(crate) fn collect_chain(tail: &mut Stage) -> String {
    let library = tail.data.library.clone();
    let entry = tail.entry();

    let mut session = library.begin_write();
    let times_played = session.property_get_int(entry, properties::TIMES_PLAYED).unwrap_or(0);
    session.entry_cleanup(entry);

    let mut name = String::new();
    collect_recursive(tail, session.as_mut(), &mut name);

    session.property_set_str(entry, properties::CHAIN, &name);
    session.property_set_int(entry, properties::TIMES_PLAYED, times_played + 1);
    session.property_set_int(entry, properties::LAST_STARTED, unix_now());
    session.entry_status_set(entry, EntryStatus::Ok);
    session.commit();
    library.entry_send_update(entry);

    name
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::stage::tests::{scripted_stage, Op};
    use chime_core::medialib::SERVER_SOURCE_ID;

    #[test]
    fn test_collect_chain_writes_counters_and_chain_name() {
        let mut stage = scripted_stage("src", vec![]);
        stage.data.metadata_set_str("title", "Song");
        let library = stage.data.library.clone();
        let entry = stage.entry();

        let name = collect_chain(&mut stage);
        assert_eq!(name, "src");
        assert!(stage.data.metadata_collected);
        assert!(!stage.data.metadata_changed);

        let session = library.begin();
        assert_eq!(session.property_get_str(entry, properties::CHAIN).as_deref(), Some("src"));
        assert_eq!(session.property_get_int(entry, properties::TIMES_PLAYED), Some(1));
        assert_eq!(
            session.property_get_int(entry, properties::STATUS),
            Some(EntryStatus::Ok.code())
        );
        assert!(session.property_get_int(entry, properties::LAST_STARTED).unwrap() > 0);
    }

    #[test]
    fn test_collect_chain_increments_existing_counter() {
        let mut stage = scripted_stage("src", vec![]);
        let library = stage.data.library.clone();
        let entry = stage.entry();
        {
            let mut session = library.begin_write();
            session.property_set_int(entry, properties::TIMES_PLAYED, 41);
            session.commit();
        }

        collect_chain(&mut stage);

        let session = library.begin();
        assert_eq!(session.property_get_int(entry, properties::TIMES_PLAYED), Some(42));
    }

    #[test]
    fn test_metadata_written_under_plugin_source() {
        let mut stage = scripted_stage("src", vec![]);
        stage.data.metadata_set_str("title", "Song");
        stage.data.metadata_set_int("bitrate", 320);
        let entry = stage.entry();

        // hold a concretely typed handle for snapshotting
        let library = stage.data.library.clone();
        collect_chain(&mut stage);

        let mut session = library.begin_write();
        let source = session.source_to_id("plugin/src");
        session.commit();
        assert_ne!(source, SERVER_SOURCE_ID);

        let session = library.begin();
        assert_eq!(session.property_get_str(entry, "title").as_deref(), Some("Song"));
        assert_eq!(session.property_get_int(entry, "bitrate"), Some(320));
    }

    #[test]
    fn test_in_flight_flush_after_collection() {
        // once collected, a stage that changes its metadata mid-read
        // writes through without touching play counters
        let mut stage = scripted_stage("src", vec![Op::Bytes(vec![1, 2, 3, 4])]);
        let library = stage.data.library.clone();
        let entry = stage.entry();
        collect_chain(&mut stage);

        let played = {
            let session = library.begin();
            session.property_get_int(entry, properties::TIMES_PLAYED)
        };

        stage.data.metadata_set_str("title", "Late Tag");
        assert!(stage.data.metadata_changed);

        let mut buf = [0u8; 4];
        assert_eq!(stage.read(&mut buf).unwrap(), 4);
        assert!(!stage.data.metadata_changed);

        let session = library.begin();
        assert_eq!(session.property_get_str(entry, "title").as_deref(), Some("Late Tag"));
        assert_eq!(session.property_get_int(entry, properties::TIMES_PLAYED), played);
    }
}

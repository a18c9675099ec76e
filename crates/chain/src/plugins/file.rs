// SPDX-FileCopyrightText: © 2025 Chime Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! File source plugin - streams local files and browses directories.
//!
//! Accepts any `application/x-url` input and rejects non-`file://`
//! schemes at init, so it should be registered after more specific URL
//! handlers. Output is raw `application/octet-stream`; demuxers and
//! decoders downstream handle format detection.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::time::UNIX_EPOCH;

use chime_core::medialib::properties;
use chime_core::{ChimeError, Result, StreamType};

use crate::plugin::{Capabilities, SeekWhence, Transform, XformPlugin};
use crate::stage::StageData;

/// Descriptor for the `file` plugin.
pub fn plugin() -> XformPlugin {
    XformPlugin::new(
        "file",
        [StreamType::builder().mimetype("application/x-url").build()],
        Capabilities { seek: true, browse: true },
        || Box::new(FileXform::default()),
    )
}

fn local_path(url: &str) -> Result<&str> {
    url.strip_prefix("file://")
        .ok_or_else(|| ChimeError::Configuration(format!("unhandled url scheme: {url}")))
}

fn unix_secs(time: std::io::Result<std::time::SystemTime>) -> Option<i32> {
    let secs = time.ok()?.duration_since(UNIX_EPOCH).ok()?.as_secs();
    i32::try_from(secs).ok()
}

#[derive(Default)]
struct FileXform {
    file: Option<File>,
}

impl FileXform {
    fn file(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| ChimeError::TransientIo("file plugin used before init".to_string()))
    }
}

impl Transform for FileXform {
    fn init(&mut self, stage: &mut StageData) -> Result<()> {
        let url = stage
            .url()
            .ok_or_else(|| ChimeError::Configuration("no url to open".to_string()))?
            .to_string();
        let path = local_path(&url)?;

        let file = File::open(path)?;
        let meta = file.metadata()?;
        stage.metadata_set_int(properties::SIZE, i32::try_from(meta.len()).unwrap_or(i32::MAX));
        if let Some(lmod) = unix_secs(meta.modified()) {
            stage.metadata_set_int(properties::LMOD, lmod);
        }

        self.file = Some(file);
        stage.set_out_type(StreamType::builder().mimetype("application/octet-stream").build());
        Ok(())
    }

    fn read(&mut self, _stage: &mut StageData, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file()?.read(buf)?)
    }

    fn seek(&mut self, _stage: &mut StageData, offset: i64, whence: SeekWhence) -> Result<u64> {
        let target = match whence {
            SeekWhence::Set => {
                SeekFrom::Start(u64::try_from(offset).map_err(|_| {
                    ChimeError::TransientIo("seek before start of file".to_string())
                })?)
            }
            SeekWhence::Cur => SeekFrom::Current(offset),
            SeekWhence::End => SeekFrom::End(offset),
        };
        Ok(self.file()?.seek(target)?)
    }

    fn browse(&mut self, stage: &mut StageData, url: &str) -> Result<()> {
        let path = local_path(url)?;

        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = entry.metadata()?;

            stage.browse_add_entry(&name, meta.is_dir());
            if meta.is_file() {
                stage.browse_add_entry_property_int(
                    properties::SIZE,
                    i32::try_from(meta.len()).unwrap_or(i32::MAX),
                );
                if let Some(lmod) = unix_secs(meta.modified()) {
                    stage.browse_add_entry_property_int(properties::LMOD, lmod);
                }
            }
        }
        Ok(())
    }
}

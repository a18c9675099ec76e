// SPDX-FileCopyrightText: © 2025 Chime Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Stream-type descriptors used for the format handshake between stages.
//!
//! A [`StreamType`] is an immutable mapping over a small closed key set
//! ([`StreamKey`]) describing what a stage emits: a mime type, the URL it
//! originates from, and for raw audio the sample format, rate, and channel
//! count. Chain assembly links stages by matching a plugin's accepted
//! input *pattern* against the previous stage's concrete output
//! ([`StreamType::matches`]); keys left unset in the pattern act as
//! wildcards.

use serde::{Deserialize, Serialize};

/// Keys of the closed stream-type descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKey {
    MimeType,
    Url,
    /// Sample format of raw audio, as a [`SampleFormat`] code.
    Format,
    SampleRate,
    Channels,
}

/// Sample formats a PCM stream can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    S8,
    U8,
    S16,
    U16,
    S32,
    U32,
    Float,
    Double,
}

impl SampleFormat {
    /// Stable integer code used in stream-type descriptors.
    pub const fn code(self) -> i32 {
        match self {
            Self::S8 => 1,
            Self::U8 => 2,
            Self::S16 => 3,
            Self::U16 => 4,
            Self::S32 => 5,
            Self::U32 => 6,
            Self::Float => 7,
            Self::Double => 8,
        }
    }

    /// The inverse of [`SampleFormat::code`].
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::S8),
            2 => Some(Self::U8),
            3 => Some(Self::S16),
            4 => Some(Self::U16),
            5 => Some(Self::S32),
            6 => Some(Self::U32),
            7 => Some(Self::Float),
            8 => Some(Self::Double),
            _ => None,
        }
    }

    /// Display name stored in media-library metadata.
    pub const fn name(self) -> &'static str {
        match self {
            Self::S8 => "S8",
            Self::U8 => "U8",
            Self::S16 => "S16",
            Self::U16 => "U16",
            Self::S32 => "S32",
            Self::U32 => "U32",
            Self::Float => "FLOAT",
            Self::Double => "DOUBLE",
        }
    }
}

/// An immutable stream-format descriptor.
///
/// Constructed once through [`StreamType::builder`], read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamType {
    mimetype: Option<String>,
    url: Option<String>,
    format: Option<SampleFormat>,
    samplerate: Option<i32>,
    channels: Option<i32>,
}

impl StreamType {
    pub fn builder() -> StreamTypeBuilder {
        StreamTypeBuilder::default()
    }

    /// String value for `key`, or `None` when unset or non-string.
    pub fn get_str(&self, key: StreamKey) -> Option<&str> {
        match key {
            StreamKey::MimeType => self.mimetype.as_deref(),
            StreamKey::Url => self.url.as_deref(),
            _ => None,
        }
    }

    /// Integer value for `key`, `-1` when unset or non-integer.
    pub fn get_int(&self, key: StreamKey) -> i32 {
        match key {
            StreamKey::Format => self.format.map_or(-1, SampleFormat::code),
            StreamKey::SampleRate => self.samplerate.unwrap_or(-1),
            StreamKey::Channels => self.channels.unwrap_or(-1),
            _ => -1,
        }
    }

    pub fn mimetype(&self) -> Option<&str> {
        self.mimetype.as_deref()
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn format(&self) -> Option<SampleFormat> {
        self.format
    }

    pub fn samplerate(&self) -> Option<i32> {
        self.samplerate
    }

    pub fn channels(&self) -> Option<i32> {
        self.channels
    }

    /// Does this *pattern* match the `concrete` type?
    ///
    /// Every key set in the pattern must be present in `concrete` with an
    /// equal value; unset pattern keys match anything. Keys set only in
    /// `concrete` are ignored.
    pub fn matches(&self, concrete: &Self) -> bool {
        fn key_ok<T: PartialEq>(pattern: Option<&T>, concrete: Option<&T>) -> bool {
            match pattern {
                None => true,
                Some(want) => concrete == Some(want),
            }
        }

        key_ok(self.mimetype.as_ref(), concrete.mimetype.as_ref())
            && key_ok(self.url.as_ref(), concrete.url.as_ref())
            && key_ok(self.format.as_ref(), concrete.format.as_ref())
            && key_ok(self.samplerate.as_ref(), concrete.samplerate.as_ref())
            && key_ok(self.channels.as_ref(), concrete.channels.as_ref())
    }
}

/// Builder for [`StreamType`]. Unset keys stay wildcards.
#[derive(Debug, Default, Clone)]
pub struct StreamTypeBuilder {
    inner: StreamType,
}

impl StreamTypeBuilder {
    #[must_use]
    pub fn mimetype(mut self, mimetype: impl Into<String>) -> Self {
        self.inner.mimetype = Some(mimetype.into());
        self
    }

    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.inner.url = Some(url.into());
        self
    }

    #[must_use]
    pub const fn format(mut self, format: SampleFormat) -> Self {
        self.inner.format = Some(format);
        self
    }

    #[must_use]
    pub const fn samplerate(mut self, samplerate: i32) -> Self {
        self.inner.samplerate = Some(samplerate);
        self
    }

    #[must_use]
    pub const fn channels(mut self, channels: i32) -> Self {
        self.inner.channels = Some(channels);
        self
    }

    pub fn build(self) -> StreamType {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samplerate: i32, channels: i32) -> StreamType {
        StreamType::builder()
            .mimetype("audio/pcm")
            .format(SampleFormat::S16)
            .samplerate(samplerate)
            .channels(channels)
            .build()
    }

    #[test]
    fn test_unset_keys_are_wildcards() {
        let pattern = StreamType::builder().mimetype("audio/pcm").build();
        assert!(pattern.matches(&pcm(44100, 2)));
        assert!(pattern.matches(&pcm(48000, 1)));
    }

    #[test]
    fn test_set_keys_must_be_equal() {
        let pattern = StreamType::builder().mimetype("audio/pcm").samplerate(44100).build();
        assert!(pattern.matches(&pcm(44100, 2)));
        assert!(!pattern.matches(&pcm(48000, 2)));
    }

    #[test]
    fn test_pattern_key_absent_in_concrete_rejects() {
        let pattern = StreamType::builder().url("file:///a").build();
        let concrete = StreamType::builder().mimetype("application/x-url").build();
        assert!(!pattern.matches(&concrete));
    }

    #[test]
    fn test_empty_pattern_matches_everything() {
        let pattern = StreamType::default();
        assert!(pattern.matches(&pcm(44100, 2)));
        assert!(pattern.matches(&StreamType::default()));
    }

    #[test]
    fn test_get_int_unset_is_minus_one() {
        let t = StreamType::builder().mimetype("audio/pcm").build();
        assert_eq!(t.get_int(StreamKey::SampleRate), -1);
        assert_eq!(t.get_int(StreamKey::Format), -1);
        assert_eq!(pcm(44100, 2).get_int(StreamKey::SampleRate), 44100);
        assert_eq!(pcm(44100, 2).get_int(StreamKey::Format), SampleFormat::S16.code());
    }

    #[test]
    fn test_sample_format_code_round_trip() {
        for fmt in [
            SampleFormat::S8,
            SampleFormat::U8,
            SampleFormat::S16,
            SampleFormat::U16,
            SampleFormat::S32,
            SampleFormat::U32,
            SampleFormat::Float,
            SampleFormat::Double,
        ] {
            assert_eq!(SampleFormat::from_code(fmt.code()), Some(fmt));
        }
        assert_eq!(SampleFormat::from_code(0), None);
    }
}

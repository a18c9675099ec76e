// SPDX-FileCopyrightText: © 2025 Chime Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Framed IPC messages.
//!
//! Every frame carries a command id, a correlation id, and an opaque
//! payload. On the wire that is a fixed 12-byte header (`cmd`, `cid`,
//! payload length, all u32 big-endian) followed by the payload.
//! [`FrameBuf`] is the incremental encode/decode cursor shared by the
//! session and the transport, so partial reads and writes can resume
//! where they stopped.

use bytes::Bytes;

/// Command id of the error reply. Its payload is a single
/// length-prefixed string.
pub const CMD_ERROR: u32 = 0;

/// Bytes of the fixed frame header.
pub const HEADER_LEN: usize = 12;

/// One decoded IPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub cmd: u32,
    pub cid: u32,
    pub payload: Bytes,
}

impl Message {
    pub fn new(cmd: u32, payload: Bytes) -> Self {
        Self { cmd, cid: 0, payload }
    }

    /// Build an error reply carrying `text`.
    pub fn error(text: &str) -> Self {
        let mut payload = Vec::with_capacity(4 + text.len());
        payload.extend_from_slice(&u32::try_from(text.len()).unwrap_or(0).to_be_bytes());
        payload.extend_from_slice(text.as_bytes());
        Self { cmd: CMD_ERROR, cid: 0, payload: Bytes::from(payload) }
    }

    /// The error string of a [`CMD_ERROR`] message. `None` for any other
    /// command; a malformed payload decodes to the placeholder string.
    pub fn error_text(&self) -> Option<String> {
        if self.cmd != CMD_ERROR {
            return None;
        }
        Some(self.decode_error_payload().unwrap_or_else(|| "No errormsg!".to_string()))
    }

    fn decode_error_payload(&self) -> Option<String> {
        let len_bytes: [u8; 4] = self.payload.get(..4)?.try_into().ok()?;
        let len = usize::try_from(u32::from_be_bytes(len_bytes)).ok()?;
        let text = self.payload.get(4..4 + len)?;
        Some(String::from_utf8_lossy(text).into_owned())
    }
}

/// Progress cursor over one encoded frame, for either direction.
#[derive(Debug, Default)]
pub struct FrameBuf {
    buf: Vec<u8>,
    /// Write direction: bytes already flushed to the transport.
    cursor: usize,
}

impl FrameBuf {
    /// Fresh read-direction frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `msg` for writing.
    pub fn encode(msg: &Message) -> Self {
        let mut buf = Vec::with_capacity(HEADER_LEN + msg.payload.len());
        buf.extend_from_slice(&msg.cmd.to_be_bytes());
        buf.extend_from_slice(&msg.cid.to_be_bytes());
        buf.extend_from_slice(&u32::try_from(msg.payload.len()).unwrap_or(0).to_be_bytes());
        buf.extend_from_slice(&msg.payload);
        Self { buf, cursor: 0 }
    }

    fn payload_len(&self) -> Option<usize> {
        let bytes: [u8; 4] = self.buf.get(8..HEADER_LEN)?.try_into().ok()?;
        usize::try_from(u32::from_be_bytes(bytes)).ok()
    }

    /// Read direction: how many more bytes complete the frame.
    pub fn wanted(&self) -> usize {
        match self.payload_len() {
            None => HEADER_LEN - self.buf.len(),
            Some(len) => (HEADER_LEN + len).saturating_sub(self.buf.len()),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.wanted() == 0
    }

    /// Read direction: append bytes arriving from the transport.
    pub fn fill(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write direction: the bytes not yet flushed.
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.cursor..]
    }

    /// Write direction: mark `n` bytes as flushed.
    pub fn advance(&mut self, n: usize) {
        self.cursor = (self.cursor + n).min(self.buf.len());
    }

    pub fn is_flushed(&self) -> bool {
        self.cursor == self.buf.len()
    }

    /// Decode a completed read-direction frame.
    pub fn decode(self) -> Option<Message> {
        if !self.is_complete() {
            return None;
        }
        let cmd = u32::from_be_bytes(self.buf.get(..4)?.try_into().ok()?);
        let cid = u32::from_be_bytes(self.buf.get(4..8)?.try_into().ok()?);
        let payload = Bytes::copy_from_slice(self.buf.get(HEADER_LEN..)?);
        Some(Message { cmd, cid, payload })
    }
}

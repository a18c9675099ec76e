// SPDX-FileCopyrightText: © 2025 Chime Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The transport collaborator: moving framed messages over some wire.
//!
//! The session drives a [`Transport`] non-blockingly and owns all frame
//! state itself; a transport only moves bytes of the frame it is handed
//! and reports [`Progress`]. Peer shutdown is a regular outcome, not an
//! error - the session reacts by disconnecting.
//!
//! [`MemoryTransport`] is the in-process implementation used by tests
//! and loopback clients, with scriptable chunking so partial reads and
//! writes are exercised for real.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::message::{FrameBuf, Message};

/// Outcome of moving one frame's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The frame is fully transferred.
    Complete,
    /// The wire would block; the frame keeps its progress.
    Partial,
    /// The peer is gone.
    Disconnected,
}

/// Readiness of the wire, as reported by [`Transport::wait`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

/// A framed, pollable, non-blocking wire.
pub trait Transport: Send {
    /// Continue reading `frame` from the wire.
    fn read_frame(&mut self, frame: &mut FrameBuf) -> Progress;

    /// Continue writing `frame` to the wire.
    fn write_frame(&mut self, frame: &mut FrameBuf) -> Progress;

    /// Raw descriptor for poll registration, when the wire has one.
    fn raw_fd(&self) -> Option<i32> {
        None
    }

    /// Block until the wire is readable (or writable, when asked) or the
    /// timeout passes.
    fn wait(&mut self, want_write: bool, timeout: Duration) -> Readiness;
}

#[derive(Debug, Default)]
struct Shared {
    /// Inbound bytes, in the chunks the peer delivered them.
    incoming: VecDeque<Vec<u8>>,
    /// Raw outbound bytes as flushed by the session.
    outgoing: Vec<u8>,
    /// Max bytes accepted per `write_frame` call; `None` is unlimited.
    write_limit: Option<usize>,
    closed: bool,
}

/// Controller handle for a [`MemoryTransport`], held by the test or the
/// in-process peer after the transport moved into the session.
#[derive(Debug, Clone, Default)]
pub struct MemoryPeer {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryPeer {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver one whole framed message.
    pub fn deliver(&self, msg: &Message) {
        self.deliver_chunk(FrameBuf::encode(msg).remaining().to_vec());
    }

    /// Deliver raw wire bytes, possibly a partial frame.
    pub fn deliver_chunk(&self, bytes: Vec<u8>) {
        self.lock().incoming.push_back(bytes);
    }

    /// Decode everything the session has flushed so far.
    pub fn take_sent(&self) -> Vec<Message> {
        let mut shared = self.lock();
        let bytes = std::mem::take(&mut shared.outgoing);
        drop(shared);

        let mut out = Vec::new();
        let mut rest = bytes.as_slice();
        while !rest.is_empty() {
            let mut frame = FrameBuf::new();
            let take = frame.wanted().min(rest.len());
            frame.fill(&rest[..take]);
            rest = &rest[take..];
            // now the header is in; pull the payload
            let take = frame.wanted().min(rest.len());
            frame.fill(&rest[..take]);
            rest = &rest[take..];
            match frame.decode() {
                Some(msg) => out.push(msg),
                None => break, // trailing partial frame stays unparsed
            }
        }
        out
    }

    /// Cap how many bytes each `write_frame` call accepts.
    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.lock().write_limit = limit;
    }

    /// Simulate the peer closing the connection.
    pub fn close(&self) {
        self.lock().closed = true;
    }
}

/// In-process [`Transport`] over shared byte queues.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    peer: MemoryPeer,
}

impl MemoryTransport {
    /// Create a transport and the controller handle for its far end.
    pub fn new() -> (Self, MemoryPeer) {
        let peer = MemoryPeer::default();
        (Self { peer: peer.clone() }, peer)
    }
}

impl Transport for MemoryTransport {
    fn read_frame(&mut self, frame: &mut FrameBuf) -> Progress {
        let mut shared = self.peer.lock();
        loop {
            if frame.is_complete() {
                return Progress::Complete;
            }
            let Some(chunk) = shared.incoming.front_mut() else {
                return if shared.closed { Progress::Disconnected } else { Progress::Partial };
            };
            let take = frame.wanted().min(chunk.len());
            frame.fill(&chunk[..take]);
            chunk.drain(..take);
            if chunk.is_empty() {
                shared.incoming.pop_front();
            }
        }
    }

    fn write_frame(&mut self, frame: &mut FrameBuf) -> Progress {
        let mut shared = self.peer.lock();
        if shared.closed {
            return Progress::Disconnected;
        }
        let remaining = frame.remaining();
        let take = shared.write_limit.map_or(remaining.len(), |limit| limit.min(remaining.len()));
        shared.outgoing.extend_from_slice(&remaining[..take]);
        frame.advance(take);
        if frame.is_flushed() {
            Progress::Complete
        } else {
            Progress::Partial
        }
    }

    fn wait(&mut self, want_write: bool, _timeout: Duration) -> Readiness {
        let shared = self.peer.lock();
        Readiness {
            readable: !shared.incoming.is_empty() || shared.closed,
            writable: want_write && !shared.closed,
        }
    }
}

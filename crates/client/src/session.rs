// SPDX-FileCopyrightText: © 2025 Chime Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The client-side IPC session.
//!
//! A [`Session`] multiplexes asynchronous request/result correlation
//! over one transport. It is driven from the outside: poll the
//! descriptor from [`Session::fd`], call [`Session::on_readable`] /
//! [`Session::on_writable`] on readiness (adding the write side only
//! while [`Session::want_write`] says so), or use
//! [`Session::wait_for_event`] for a simple built-in turn of that loop.
//!
//! Outbound messages go out in enqueue order; replies fire in arrival
//! order, not request order. Once the peer goes away the session is
//! sticky-disconnected: every further operation fails fast and the
//! disconnect callback has fired exactly once.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chime_core::{ChimeError, Result};

use crate::message::{FrameBuf, Message, CMD_ERROR};
use crate::result::{PendingResult, Reply};
use crate::transport::{Progress, Transport};

type ResultsTable = Arc<Mutex<HashMap<u32, PendingResult>>>;

/// Client-side IPC session over one transport.
pub struct Session {
    transport: Box<dyn Transport>,
    /// Partially read inbound frame, kept across `on_readable` calls.
    read_msg: Option<FrameBuf>,
    /// Outbound frames, head possibly partially written.
    out_queue: VecDeque<FrameBuf>,
    results: ResultsTable,
    next_cid: u32,
    error: Option<String>,
    disconnected: bool,
    disconnect_cb: Option<Box<dyn FnMut() + Send>>,
}

impl Session {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Box::new(transport),
            read_msg: None,
            out_queue: VecDeque::new(),
            results: Arc::new(Mutex::new(HashMap::new())),
            next_cid: 0,
            error: None,
            disconnected: false,
            disconnect_cb: None,
        }
    }

    /// Descriptor to poll, when the transport has one.
    pub fn fd(&self) -> Option<i32> {
        self.transport.raw_fd()
    }

    pub const fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// The error that took the session down, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Callback fired exactly once when the peer goes away.
    pub fn set_disconnect_callback(&mut self, callback: impl FnMut() + Send + 'static) {
        self.disconnect_cb = Some(Box::new(callback));
    }

    /// True while there is outbound data and the session is alive; add
    /// the write side to the poll set only in that case.
    pub fn want_write(&self) -> bool {
        !self.out_queue.is_empty() && !self.disconnected
    }

    fn lock_results(&self) -> MutexGuard<'_, HashMap<u32, PendingResult>> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a result slot under its cid.
    pub fn register_result(&self, result: &PendingResult) {
        self.lock_results().insert(result.cid(), result.clone());
    }

    /// Remove a result slot.
    pub fn unregister_result(&self, result: &PendingResult) {
        self.lock_results().remove(&result.cid());
    }

    /// The slot registered under `cid`, if any.
    pub fn lookup_result(&self, cid: u32) -> Option<PendingResult> {
        self.lock_results().get(&cid).cloned()
    }

    /// Next correlation id. Wraps; id reuse at 2^32 requests is the
    /// peer's problem long before it is ours.
    pub fn next_cid(&mut self) -> u32 {
        self.next_cid = self.next_cid.wrapping_add(1);
        self.next_cid
    }

    /// Stamp `cid` onto `msg` and queue it for writing.
    ///
    /// # Errors
    ///
    /// [`ChimeError::Disconnected`] after the session went down.
    pub fn send(&mut self, mut msg: Message, cid: u32) -> Result<()> {
        if self.disconnected {
            return Err(ChimeError::Disconnected);
        }
        msg.cid = cid;
        self.out_queue.push_back(FrameBuf::encode(&msg));
        Ok(())
    }

    /// Assign a cid, register a result slot, and queue the request.
    ///
    /// # Errors
    ///
    /// [`ChimeError::Disconnected`] after the session went down.
    pub fn send_request(&mut self, msg: Message) -> Result<PendingResult> {
        if self.disconnected {
            return Err(ChimeError::Disconnected);
        }
        let cid = self.next_cid();
        let result = PendingResult::new(cid);
        self.register_result(&result);
        self.send(msg, cid)?;
        Ok(result)
    }

    /// Drain the transport: decode every complete frame and route it. A
    /// partial frame stays put for the next call.
    pub fn on_readable(&mut self) {
        if self.disconnected {
            return;
        }

        loop {
            let mut frame = self.read_msg.take().unwrap_or_default();
            match self.transport.read_frame(&mut frame) {
                Progress::Complete => {
                    // the in-progress slot stays empty while dispatching,
                    // so a handler issuing further requests cannot
                    // corrupt the reader state
                    match frame.decode() {
                        Some(msg) => self.dispatch(msg),
                        None => tracing::warn!("dropping undecodable frame"),
                    }
                }
                Progress::Partial => {
                    self.read_msg = Some(frame);
                    return;
                }
                Progress::Disconnected => {
                    self.disconnect();
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, msg: Message) {
        // the table lock is never held across delivery
        let result = self.lookup_result(msg.cid);
        let Some(result) = result else {
            tracing::debug!("no result registered for cid {}, dropping", msg.cid);
            return;
        };

        if msg.cmd == CMD_ERROR {
            let text = msg.error_text().unwrap_or_else(|| "No errormsg!".to_string());
            result.deliver(Reply::Error(text));
        } else {
            result.deliver(Reply::Value(msg));
        }
    }

    /// Flush the out-queue as far as the transport lets us.
    pub fn on_writable(&mut self) {
        if self.disconnected {
            return;
        }

        while let Some(frame) = self.out_queue.front_mut() {
            match self.transport.write_frame(frame) {
                Progress::Complete => {
                    self.out_queue.pop_front();
                }
                Progress::Partial => return,
                Progress::Disconnected => {
                    self.disconnect();
                    return;
                }
            }
        }
    }

    /// One turn of a simple event loop: wait for readiness, then run the
    /// matching callbacks.
    pub fn wait_for_event(&mut self, timeout: Duration) {
        if self.disconnected {
            return;
        }
        let readiness = self.transport.wait(self.want_write(), timeout);
        if readiness.readable {
            self.on_readable();
        }
        if readiness.writable {
            self.on_writable();
        }
    }

    /// Tear the session down. Sticky; the disconnect callback fires
    /// exactly once.
    pub fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        self.read_msg = None;
        self.error = Some("Disconnected".to_string());
        if let Some(mut callback) = self.disconnect_cb.take() {
            callback();
        }
    }
}

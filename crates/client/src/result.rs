// SPDX-FileCopyrightText: © 2025 Chime Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Pending-result correlation slots.
//!
//! A [`PendingResult`] is registered under its correlation id before the
//! request goes out; the session routes the matching reply into it.
//! Results are `Arc`-shared and deliberately outlive the session - the
//! owner drops them when done.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::message::Message;

/// What came back for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Value(Message),
    Error(String),
}

#[derive(Debug, Default)]
struct Slot {
    reply: Option<Reply>,
}

/// A correlation slot for one in-flight request.
#[derive(Debug, Clone)]
pub struct PendingResult {
    cid: u32,
    slot: Arc<Mutex<Slot>>,
}

impl PendingResult {
    pub fn new(cid: u32) -> Self {
        Self { cid, slot: Arc::new(Mutex::new(Slot::default())) }
    }

    pub const fn cid(&self) -> u32 {
        self.cid
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route a reply into the slot. Later replies with the same cid
    /// overwrite earlier ones, matching broadcast-style results.
    pub(crate) fn deliver(&self, reply: Reply) {
        self.lock().reply = Some(reply);
    }

    pub fn is_ready(&self) -> bool {
        self.lock().reply.is_some()
    }

    /// The reply, if one arrived.
    pub fn reply(&self) -> Option<Reply> {
        self.lock().reply.clone()
    }

    /// Take the reply out, leaving the slot empty for a follow-up
    /// (signals deliver repeatedly under one cid).
    pub fn take_reply(&self) -> Option<Reply> {
        self.lock().reply.take()
    }
}

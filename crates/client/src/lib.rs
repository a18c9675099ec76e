// SPDX-FileCopyrightText: © 2025 Chime Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Chime Client - the client-side IPC session for the chime media
//! daemon.
//!
//! Integrate the session into your main loop: poll the descriptor from
//! [`Session::fd`], call [`Session::on_readable`] when data arrives,
//! and add the write side while [`Session::want_write`] is true, calling
//! [`Session::on_writable`] on write readiness. [`Session::wait_for_event`]
//! runs one such turn without an external poller.
//!
//! ## Core Modules
//!
//! - [`message`]: Wire frames and the incremental frame cursor
//! - [`transport`]: The transport collaborator trait and the in-process
//!   implementation
//! - [`result`]: Pending-result correlation slots
//! - [`session`]: The session itself

// Module declarations
pub mod message;
pub mod result;
pub mod session;
pub mod transport;

// Convenience re-exports for commonly used types
pub use message::{FrameBuf, Message, CMD_ERROR};
pub use result::{PendingResult, Reply};
pub use session::Session;
pub use transport::{MemoryPeer, MemoryTransport, Progress, Readiness, Transport};

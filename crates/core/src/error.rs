// SPDX-FileCopyrightText: © 2025 Chime Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for chime.
//!
//! One categorized error enum serves the whole workspace so that chain,
//! browse, and IPC failures can be matched on programmatically. Every
//! variant carries a descriptive message; the stage layer additionally
//! keeps a sticky error flag of its own (see `chime-chain`).

use thiserror::Error;

/// Main error type for chime operations.
#[derive(Debug, Error)]
pub enum ChimeError {
    /// A plugin read or seek failed at runtime.
    ///
    /// The owning stage becomes sticky-errored: all further reads on it
    /// fail with this kind without calling the plugin again.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// A plugin broke its contract.
    ///
    /// Examples:
    /// - `read` claimed more bytes than the buffer it was handed
    /// - `init` returned without setting an output stream type
    /// - an upstream read reached the synthetic chain head
    #[error("plugin contract violation: {0}")]
    ProtocolViolation(String),

    /// The chain builder exhausted the registry before reaching a goal
    /// format.
    #[error("no matching plugin: {0}")]
    NoMatchingPlugin(String),

    /// Seek was requested on a stage whose plugin provides no seek method.
    #[error("seek not implemented: {0}")]
    Unseekable(String),

    /// The IPC peer closed the connection. Sticky: every operation on the
    /// session fails after this.
    #[error("disconnected")]
    Disconnected,

    /// No plugin could browse the URL, or the plugin's browse method
    /// failed.
    #[error("unknown browse target: {0}")]
    UnknownBrowseTarget(String),

    /// Configuration or parameter validation error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results using [`ChimeError`].
pub type Result<T> = std::result::Result<T, ChimeError>;

// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for Manifold.
//!
//! Errors are categorized by how the rest of the system reacts to them:
//! tracks are the unit of local recovery, a stream is the unit of restart,
//! a connection is the unit of disposal.

use thiserror::Error;

/// Main error type for Manifold operations.
#[derive(Debug, Error)]
pub enum ManifoldError {
    /// A stream, input, or shared page does not exist.
    ///
    /// Outputs translate this into a 404-equivalent response.
    #[error("not found: {0}")]
    NotFound(String),

    /// The stream exists but is still booting (INIT/BOOT state byte).
    ///
    /// Callers retry with a bounded poll loop.
    #[error("not ready: {0}")]
    NotReady(String),

    /// A bounded wait (boot handshake, page load, heartbeat) expired.
    ///
    /// Escalates to `Fatal` when sustained.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Shared data failed validation (bad key index, sentinel where data
    /// was expected). Only the affected track is dropped.
    #[error("corruption: {0}")]
    Corruption(String),

    /// A push source was not whitelisted; the connection is closed.
    #[error("authorization denied: {0}")]
    AuthDenied(String),

    /// Request-level validation error (oversized stream name, bad track
    /// specification).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Unrecoverable process-level failure (cannot map a required page,
    /// exec failure). Terminates the current process; the supervisor may
    /// restart it.
    #[error("fatal: {0}")]
    Fatal(String),

    /// I/O error from the backing filesystem or a socket.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results using `ManifoldError`.
pub type Result<T> = std::result::Result<T, ManifoldError>;

impl ManifoldError {
    /// Whether this error should take the whole process down rather than
    /// just the current track or connection.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

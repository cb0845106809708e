// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Manifold Core - data model and lifecycle types for the streaming server.
//!
//! This crate defines what every Manifold process agrees on:
//!
//! - [`types`]: tracks, keys, fragments, packets, and stream metadata
//! - [`capa`]: the capability snapshot (inputs, connectors, codec templates)
//! - [`state`]: the one-byte stream lifecycle state machine
//! - [`error`]: error kinds and the crate-wide `Result` alias
//! - [`limits`]: cross-process tuning constants
//! - [`runtime`]: the three per-process singletons (active flag, debug
//!   level, stream name)
//!
//! Everything that actually moves these types between processes lives in
//! `manifold-shm` and `manifold-bus`.

pub mod capa;
pub mod error;
pub mod limits;
pub mod runtime;
pub mod state;
pub mod types;

// Convenience re-exports for the types used on nearly every page.
pub use error::{ManifoldError, Result};
pub use state::StreamState;
pub use types::{Fragment, Key, MediaPacket, Part, StreamMeta, Track, TrackKind};

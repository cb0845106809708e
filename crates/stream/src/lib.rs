// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Manifold Stream - name resolution, input matching, and supervision.
//!
//! Everything between "a client asked for stream X" and "an input process
//! owns stream X" lives here:
//!
//! - [`name`]: stream name sanitization and the base/wildcard split
//! - [`vars`]: `$stream`/`$datetime`-style source variable expansion
//! - [`capa`]: capability and stream-config snapshot access
//! - [`resolver`]: input matching and parameter assembly
//! - [`supervisor`]: the boot handshake and input auto-start
//! - [`angel`]: crash supervision for input processes
//! - [`procs`]: the child process registry

pub mod angel;
pub mod capa;
pub mod name;
pub mod procs;
pub mod resolver;
pub mod supervisor;
pub mod vars;

pub use name::{base_name, checked_name, sanitize_name, wildcard};
pub use supervisor::{start_input, stream_alive, stream_status, StartOptions, Started, StatePage};
pub use vars::expand_variables;

// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Stream lifecycle state machine.
//!
//! Every stream has a one-byte shared page (`MstSTATE@<name>`) holding the
//! current [`StreamState`]. The owning input writes it; the supervisor and
//! all outputs read it to drive the boot/shutdown handshake.
//!
//! ## State Machine
//!
//! ```text
//! OFF → INIT → BOOT → WAIT|READY ⇌ SHUTDOWN → OFF
//!                       │
//!                       └→ INVALID → (restart)
//! ```
//!
//! INVALID is only transient during a supervised restart; a stream that
//! stays INVALID is crashing repeatedly.

use serde::{Deserialize, Serialize};

/// Value of the stream-state byte.
///
/// The numeric values are part of the shared-memory contract and must not
/// be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// No input process exists. Also reported when the state page is absent.
    Off,
    /// An input has claimed the stream and is setting up shared structures.
    Init,
    /// The input is reading headers / waiting for its first media data.
    Boot,
    /// A push-style input is waiting for a source to connect. Providers may
    /// attach in this state; plain consumers keep waiting.
    Wait,
    /// Metadata and data pages are live; outputs may attach.
    Ready,
    /// The input is tearing down; pages are about to disappear.
    Shutdown,
    /// The supervised worker exited abnormally and is being restarted.
    Invalid,
}

impl StreamState {
    /// Decodes a state byte. Unknown values map to `Invalid`.
    pub const fn from_byte(b: u8) -> Self {
        match b {
            0 => Self::Off,
            1 => Self::Init,
            2 => Self::Boot,
            3 => Self::Wait,
            4 => Self::Ready,
            5 => Self::Shutdown,
            _ => Self::Invalid,
        }
    }

    /// Encodes this state as its shared-page byte value.
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Init => 1,
            Self::Boot => 2,
            Self::Wait => 3,
            Self::Ready => 4,
            Self::Shutdown => 5,
            Self::Invalid => 255,
        }
    }

    /// States the boot handshake keeps polling through. OFF and READY always
    /// break the wait; WAIT additionally breaks it for providers.
    pub const fn is_transitional(self) -> bool {
        matches!(self, Self::Init | Self::Boot | Self::Shutdown | Self::Invalid)
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Off => "off",
            Self::Init => "init",
            Self::Boot => "boot",
            Self::Wait => "wait",
            Self::Ready => "ready",
            Self::Shutdown => "shutdown",
            Self::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_round_trip() {
        for state in [
            StreamState::Off,
            StreamState::Init,
            StreamState::Boot,
            StreamState::Wait,
            StreamState::Ready,
            StreamState::Shutdown,
            StreamState::Invalid,
        ] {
            assert_eq!(StreamState::from_byte(state.as_byte()), state);
        }
    }

    #[test]
    fn test_unknown_bytes_are_invalid() {
        assert_eq!(StreamState::from_byte(6), StreamState::Invalid);
        assert_eq!(StreamState::from_byte(200), StreamState::Invalid);
    }

    #[test]
    fn test_transitional_states() {
        assert!(StreamState::Boot.is_transitional());
        assert!(StreamState::Invalid.is_transitional());
        assert!(!StreamState::Off.is_transitional());
        assert!(!StreamState::Ready.is_transitional());
        assert!(!StreamState::Wait.is_transitional());
    }
}

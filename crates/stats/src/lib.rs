// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Manifold Stats - session statistics aggregation.
//!
//! Connections report through [`exchange`]; the controller-side
//! [`aggregator`] folds those reports into [`session`]s keyed by the
//! `(host, crc, stream, connector)` tuple, so viewers stay one session
//! across reconnects. Retired sessions land in the [`access_log`].

pub mod access_log;
pub mod aggregator;
pub mod exchange;
pub mod session;

pub use access_log::AccessLog;
pub use aggregator::{Aggregator, ClientsReply, ClientsRequest, TotalsReply, TotalsRequest};
pub use exchange::{host_to_string, StatHandle, StatRecord, StatServer};
pub use session::{AccessEvent, SessIndex, SessType, StatSession, StreamTotals};

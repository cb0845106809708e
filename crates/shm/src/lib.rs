// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Manifold SHM - the shared-memory substrate.
//!
//! All cross-process communication in Manifold goes through this crate:
//!
//! - [`page`]: named, fixed-size shared pages (file-backed mappings)
//! - [`sem`]: named semaphores with try-wait / post / abandon semantics
//! - [`rel`]: the typed relational accessor over an append-only table
//! - [`names`]: the page and semaphore naming templates
//! - [`scratch`]: scratch directory resolution
//!
//! Page and semaphore names are a host-wide contract; the templates in
//! [`names`] must stay byte-identical across versions.

pub mod names;
pub mod page;
pub mod rel;
pub mod scratch;
pub mod sem;

pub use page::SharedPage;
pub use rel::{FieldKind, FieldSpec, RelTable};
pub use sem::NamedSemaphore;

// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Stream name sanitization.
//!
//! A stream name is a sanitized base name, optionally followed by `+` and
//! a wildcard tail. The base name alone indexes configuration; the full
//! name indexes runtime state, so `test+a` and `test+b` have separate
//! locks and pages.

use manifold_core::limits::MAX_STREAM_NAME;
use manifold_core::{ManifoldError, Result};

fn sanitize_part(part: &str) -> String {
    let part = part.split('?').next().unwrap_or("");
    part.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Filters a stream name: lowercase, query strings stripped, anything that
/// is not alphanumeric/underscore/dot dropped. The first `+` or space
/// separates the base name from the wildcard tail; both halves are
/// sanitized independently.
///
/// Sanitization is idempotent.
pub fn sanitize_name(name: &str) -> String {
    name.find(['+', ' ']).map_or_else(
        || sanitize_part(name),
        |idx| format!("{}+{}", sanitize_part(&name[..idx]), sanitize_part(&name[idx + 1..])),
    )
}

/// Sanitizes and enforces the length bound. Oversized names are refused
/// before they can reach any page name.
pub fn checked_name(name: &str) -> Result<String> {
    let clean = sanitize_name(name);
    if clean.len() > MAX_STREAM_NAME {
        return Err(ManifoldError::BadRequest(format!(
            "stream name is longer than {MAX_STREAM_NAME} characters ({})",
            clean.len()
        )));
    }
    Ok(clean)
}

/// The base name: everything before the first `+` or space.
pub fn base_name(name: &str) -> &str {
    name.find(['+', ' ']).map_or(name, |idx| &name[..idx])
}

/// The wildcard tail after the first `+`, if any.
pub fn wildcard(name: &str) -> Option<&str> {
    name.find('+').map(|idx| &name[idx + 1..])
}

// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Push source authorization.
//!
//! A stream accepts pushed media only when its configured source is a
//! `push://` URI, and, when that URI names a host, only from that host.

use manifold_core::{ManifoldError, Result, StreamMeta};

/// Checks whether a push from `peer_host` into this stream is allowed.
pub fn allow_push(meta: &StreamMeta, peer_host: &str) -> Result<()> {
    let source = meta.source.as_str();
    if source.is_empty() {
        return Err(ManifoldError::AuthDenied(
            "push rejected - stream not configured or unavailable".to_string(),
        ));
    }
    let Some(rest) = source.strip_prefix("push://") else {
        return Err(ManifoldError::AuthDenied(format!(
            "push rejected - {source} is not a push-able stream"
        )));
    };
    let allowed = rest.split('@').next().unwrap_or("");
    if !allowed.is_empty() && allowed != peer_host {
        return Err(ManifoldError::AuthDenied(format!(
            "push from {peer_host} rejected - source host not whitelisted"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with_source(source: &str) -> StreamMeta {
        StreamMeta { live: true, source: source.to_string(), ..Default::default() }
    }

    #[test]
    fn test_open_push_source_accepts_anyone() {
        let meta = meta_with_source("push://");
        assert!(allow_push(&meta, "203.0.113.9").is_ok());
    }

    #[test]
    fn test_whitelisted_host_only() {
        let meta = meta_with_source("push://10.0.0.5@live");
        assert!(allow_push(&meta, "10.0.0.5").is_ok());
        assert!(matches!(
            allow_push(&meta, "10.0.0.6"),
            Err(ManifoldError::AuthDenied(_))
        ));
    }

    #[test]
    fn test_non_push_source_rejected() {
        let meta = meta_with_source("/media/file.mfs");
        assert!(matches!(allow_push(&meta, "10.0.0.5"), Err(ManifoldError::AuthDenied(_))));
    }

    #[test]
    fn test_unconfigured_source_rejected() {
        let meta = meta_with_source("");
        assert!(allow_push(&meta, "10.0.0.5").is_err());
    }
}

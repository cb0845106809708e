// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Capability and stream-config snapshot access.
//!
//! The controller publishes both snapshots as JSON blobs on their shared
//! pages; every other process only ever reads them.

use crate::name::base_name;
use manifold_core::capa::Capabilities;
use manifold_core::limits::CONF_PAGE_SIZE;
use manifold_core::{ManifoldError, Result};
use manifold_shm::{names, SharedPage};

/// Reads the host capability snapshot. Fails with `NotFound` when the
/// controller has not published one (is the controller running?).
pub fn read_capabilities() -> Result<Capabilities> {
    let page = SharedPage::open(names::CAPA)?;
    let blob = page
        .read_blob()?
        .ok_or_else(|| ManifoldError::NotReady("capability snapshot".to_string()))?;
    serde_json::from_slice(blob)
        .map_err(|e| ManifoldError::Corruption(format!("capability snapshot: {e}")))
}

/// Publishes the capability snapshot. Controller only. The returned page
/// must stay alive for as long as the snapshot should be readable.
pub fn publish_capabilities(capa: &Capabilities) -> Result<SharedPage> {
    let mut page = SharedPage::create(names::CAPA, CONF_PAGE_SIZE)?;
    let blob = serde_json::to_vec(capa)
        .map_err(|e| ManifoldError::Fatal(format!("serialize capabilities: {e}")))?;
    page.write_blob(&blob)?;
    Ok(page)
}

/// Configuration of a single stream, as published on its `MstCnf@` page.
/// Arbitrary keys are kept verbatim so inputs can look up their own
/// parameters.
#[derive(Debug, Clone)]
pub struct StreamConfig(pub serde_json::Value);

impl StreamConfig {
    pub fn source(&self) -> Option<&str> {
        self.0.get("source").and_then(serde_json::Value::as_str)
    }

    pub fn always_on(&self) -> bool {
        self.0.get("always_on").and_then(serde_json::Value::as_bool).unwrap_or(false)
    }

    /// String form of an arbitrary config value, for parameter assembly.
    pub fn value_str(&self, key: &str) -> Option<String> {
        match self.0.get(key) {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        }
    }
}

/// Reads the configuration for a stream, indexed by its base name.
/// A missing page is not an error: unconfigured streams may still be
/// started with a manual source.
pub fn stream_config(stream: &str) -> Result<Option<StreamConfig>> {
    let page = match SharedPage::open(&names::stream_conf(base_name(stream))) {
        Ok(page) => page,
        Err(ManifoldError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    let Some(blob) = page.read_blob()? else {
        return Ok(None);
    };
    let value = serde_json::from_slice(blob)
        .map_err(|e| ManifoldError::Corruption(format!("stream config: {e}")))?;
    Ok(Some(StreamConfig(value)))
}

/// Publishes one stream's configuration. Controller only.
pub fn publish_stream_config(base: &str, config: &serde_json::Value) -> Result<SharedPage> {
    let mut page = SharedPage::create(&names::stream_conf(base), CONF_PAGE_SIZE)?;
    let blob = serde_json::to_vec(config)
        .map_err(|e| ManifoldError::Fatal(format!("serialize stream config: {e}")))?;
    page.write_blob(&blob)?;
    Ok(page)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_config_round_trip() {
        let cfg = json!({"source": "/media/vod.mfs", "always_on": true, "port": 4242});
        let _page = publish_stream_config("cfgtest", &cfg).unwrap();
        let read = stream_config("cfgtest+wild").unwrap().expect("config present");
        assert_eq!(read.source(), Some("/media/vod.mfs"));
        assert!(read.always_on());
        assert_eq!(read.value_str("port").unwrap(), "4242");
        assert!(read.value_str("missing").is_none());
    }

    #[test]
    fn test_missing_config_is_none() {
        assert!(stream_config("never-configured-stream").unwrap().is_none());
    }
}

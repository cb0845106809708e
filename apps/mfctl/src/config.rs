// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Controller configuration.
//!
//! One JSON blob holds everything the controller publishes: stream
//! definitions and the capability snapshot. Values can be overridden
//! through `MANIFOLD_`-prefixed environment variables.

use figment::providers::{Env, Format, Json};
use figment::Figment;
use manifold_core::capa::{Capabilities, ConnectorDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One configured stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEntry {
    /// Source URI; may contain stream variables.
    pub source: String,
    /// Keep the input running even without users.
    #[serde(default)]
    pub always_on: bool,
    /// Input-specific parameters, passed through verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Log output format for the file layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// One of the tracing levels, config-friendly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Self::ERROR,
            LogLevel::Warn => Self::WARN,
            LogLevel::Info => Self::INFO,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Trace => Self::TRACE,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub console_enable: bool,
    pub console_level: LogLevel,
    pub file_enable: bool,
    pub file_level: LogLevel,
    pub file_path: String,
    pub file_format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enable: true,
            console_level: LogLevel::Info,
            file_enable: false,
            file_level: LogLevel::Info,
            file_path: "logs/mfctl.log".to_string(),
            file_format: LogFormat::Text,
        }
    }
}

/// The controller's configuration blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub streams: BTreeMap<String, StreamEntry>,
    #[serde(default)]
    pub log: LogConfig,
    /// Overrides the built-in capability snapshot when present.
    #[serde(default)]
    pub capabilities: Option<Capabilities>,
}

/// Result of loading configuration, remembering whether the file existed.
pub struct LoadResult {
    pub config: Config,
    pub file_missing: Option<String>,
}

/// Loads the configuration: JSON file layered under environment
/// overrides.
pub fn load(path: &str) -> Result<LoadResult, figment::Error> {
    let file_missing =
        (!std::path::Path::new(path).exists()).then(|| path.to_string());
    let config = Figment::new()
        .merge(Json::file(path))
        .merge(Env::prefixed("MANIFOLD_").split("__"))
        .extract()?;
    Ok(LoadResult { config, file_missing })
}

/// Renders the default configuration blob.
pub fn generate_default() -> Result<String, serde_json::Error> {
    let mut config = Config::default();
    config.streams.insert(
        "example".to_string(),
        StreamEntry {
            source: "/media/example.mfs".to_string(),
            always_on: false,
            extra: BTreeMap::new(),
        },
    );
    serde_json::to_string_pretty(&config)
}

/// The host capability snapshot shipped with this build: the file input
/// and the raw connector.
pub fn builtin_capabilities() -> Capabilities {
    let file_input = serde_json::json!({
        "name": "file",
        "source_match": ["/*", "file://*"],
        "priority": 9,
        "optional": {
            "realtime": {
                "option": "--realtime",
                "help": "Make this input run as a simulated live stream"
            },
            "simulated-starttime": {
                "option": "--simulated-starttime",
                "type": "uint",
                "help": "Unix timestamp the simulated stream playback is based on"
            },
            "debug": {
                "option": "--debug",
                "type": "debug",
                "help": "The debug level at which messages need to be printed"
            }
        }
    });
    let inputs = vec![serde_json::from_value(file_input).unwrap_or_default()];

    let raw = ConnectorDescriptor {
        name: "raw".to_string(),
        codecs: vec![vec![vec!["+*".to_string()]]],
        ..Default::default()
    };
    Capabilities { inputs, connectors: vec![raw] }
}

/// The effective capability snapshot for a loaded configuration.
pub fn capabilities(config: &Config) -> Capabilities {
    config.capabilities.clone().unwrap_or_else(builtin_capabilities)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_blob_parses_back() {
        let blob = generate_default().unwrap();
        let config: Config = serde_json::from_str(&blob).unwrap();
        assert!(config.streams.contains_key("example"));
        assert!(config.log.console_enable);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"streams": {{"vod1": {{"source": "/media/a.mfs", "always_on": true, "port": 99}}}}}}"#
        )
        .unwrap();
        let result = load(file.path().to_str().unwrap()).unwrap();
        assert!(result.file_missing.is_none());
        let entry = &result.config.streams["vod1"];
        assert_eq!(entry.source, "/media/a.mfs");
        assert!(entry.always_on);
        assert_eq!(entry.extra["port"], serde_json::json!(99));
    }

    #[test]
    fn test_missing_file_reports_and_defaults() {
        let result = load("/definitely/not/here.json").unwrap();
        assert!(result.file_missing.is_some());
        assert!(result.config.streams.is_empty());
    }

    #[test]
    fn test_builtin_capabilities_shape() {
        let capa = builtin_capabilities();
        assert_eq!(capa.inputs[0].name, "file");
        assert!(capa.inputs[0].optional.contains_key("realtime"));
        assert_eq!(capa.connectors[0].name, "raw");
    }
}

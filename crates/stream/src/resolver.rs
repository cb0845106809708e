// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Input matching and parameter assembly.
//!
//! A source URI is matched against every input descriptor's glob patterns;
//! the highest-priority match wins. Parameters are resolved from override
//! map and stream configuration into the typed argument list that is
//! encoded to argv only at the exec boundary.

use crate::capa::StreamConfig;
use manifold_core::capa::{Capabilities, InputDescriptor};
use manifold_core::{ManifoldError, Result};
use std::collections::BTreeMap;

/// Matches a value against a pattern containing a single `*`: literal
/// prefix and suffix around it must both match. A pattern without `*`
/// must match exactly.
pub fn source_matches(pattern: &str, value: &str) -> bool {
    pattern.find('*').map_or(pattern == value, |star| {
        let front = &pattern[..star];
        let back = &pattern[star + 1..];
        value.len() >= front.len() + back.len()
            && value.starts_with(front)
            && value.ends_with(back)
    })
}

/// Selects the input descriptor responsible for the given source URI.
///
/// Strictly higher priority replaces the current winner, so descriptors
/// with equal priority resolve to the lowest index — a deterministic
/// tiebreak the configuration format leaves open. Non-provider descriptors
/// are skipped when the caller is not a provider; when that was the only
/// reason nothing matched, the error says so.
pub fn input_by_source<'a>(
    capa: &'a Capabilities,
    source: &str,
    is_provider: bool,
) -> Result<&'a InputDescriptor> {
    let mut best: Option<&InputDescriptor> = None;
    let mut best_priority = i64::MIN;
    let mut provider_only_match = false;

    for input in &capa.inputs {
        if input.priority <= best_priority && best.is_some() {
            continue;
        }
        let matched = input.source_match.iter().any(|p| source_matches(p, source));
        if !matched {
            continue;
        }
        if input.non_provider && !is_provider {
            provider_only_match = true;
            continue;
        }
        tracing::debug!(input = %input.name, priority = input.priority, "input matches source");
        best_priority = input.priority;
        best = Some(input);
    }

    best.ok_or_else(|| {
        if provider_only_match {
            ManifoldError::NotFound(format!("not a media provider for input: {source}"))
        } else {
            ManifoldError::NotFound(format!("no compatible input found for: {source}"))
        }
    })
}

/// One resolved argument: the option flag and its value. An empty value
/// means the flag is passed bare.
pub type ResolvedArg = (String, String);

/// Resolves the argument list for an input start.
///
/// For required parameters the override map wins over the stream config;
/// if neither supplies a value the start fails. Optional parameters are
/// passed only when a value is present. A parameter whose descriptor has
/// no `type` has its value forced to the empty string — the snapshot
/// format records flag-style parameters that way, and the sentinel is
/// preserved literally.
pub fn assemble_params(
    input: &InputDescriptor,
    config: Option<&StreamConfig>,
    overrides: &BTreeMap<String, String>,
) -> Result<Vec<ResolvedArg>> {
    let mut args = Vec::new();

    for (name, param) in &input.required {
        let value = overrides
            .get(name)
            .cloned()
            .or_else(|| config.and_then(|c| c.value_str(name)))
            .ok_or_else(|| {
                ManifoldError::BadRequest(format!("required parameter {name} missing"))
            })?;
        let value = if param.kind.is_none() { String::new() } else { value };
        args.push((param.option.clone(), value));
    }

    for (name, param) in &input.optional {
        let Some(value) =
            overrides.get(name).cloned().or_else(|| config.and_then(|c| c.value_str(name)))
        else {
            continue;
        };
        let value = if param.kind.is_none() { String::new() } else { value };
        args.push((param.option.clone(), value));
    }

    Ok(args)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use manifold_core::capa::ParamDescriptor;
    use serde_json::json;

    fn descriptor(name: &str, patterns: &[&str], priority: i64, non_provider: bool) -> InputDescriptor {
        InputDescriptor {
            name: name.to_string(),
            source_match: patterns.iter().map(ToString::to_string).collect(),
            priority,
            non_provider,
            ..Default::default()
        }
    }

    #[test]
    fn test_glob_prefix_suffix() {
        assert!(source_matches("file://*", "file:///media/a.mfs"));
        assert!(source_matches("/*", "/media/a.mfs"));
        assert!(source_matches("push://*.ts", "push://host/x.ts"));
        assert!(!source_matches("push://*", "file:///x"));
        assert!(!source_matches("*.ts", "short"));
    }

    #[test]
    fn test_highest_priority_wins() {
        let capa = Capabilities {
            inputs: vec![
                descriptor("generic", &["*"], 1, false),
                descriptor("file", &["/*"], 9, false),
            ],
            connectors: vec![],
        };
        let input = input_by_source(&capa, "/media/a.mfs", false).unwrap();
        assert_eq!(input.name, "file");
    }

    #[test]
    fn test_equal_priority_keeps_lowest_index() {
        let capa = Capabilities {
            inputs: vec![
                descriptor("first", &["/*"], 5, false),
                descriptor("second", &["/*"], 5, false),
            ],
            connectors: vec![],
        };
        let input = input_by_source(&capa, "/media/a.mfs", false).unwrap();
        assert_eq!(input.name, "first");
    }

    #[test]
    fn test_non_provider_skipped_for_consumers() {
        let capa = Capabilities {
            inputs: vec![descriptor("push", &["push://*"], 9, true)],
            connectors: vec![],
        };
        let err = input_by_source(&capa, "push://host/live", false).unwrap_err();
        assert!(err.to_string().contains("not a media provider"));

        let input = input_by_source(&capa, "push://host/live", true).unwrap();
        assert_eq!(input.name, "push");
    }

    #[test]
    fn test_no_match_is_not_found() {
        let capa = Capabilities::default();
        assert!(matches!(
            input_by_source(&capa, "gopher://x", false),
            Err(ManifoldError::NotFound(_))
        ));
    }

    fn input_with_params() -> InputDescriptor {
        let mut input = descriptor("file", &["/*"], 9, false);
        input.required.insert(
            "port".to_string(),
            ParamDescriptor { option: "--port".to_string(), kind: Some("uint".to_string()), ..Default::default() },
        );
        input.optional.insert(
            "realtime".to_string(),
            ParamDescriptor { option: "--realtime".to_string(), kind: None, ..Default::default() },
        );
        input
    }

    #[test]
    fn test_override_wins_over_config() {
        let input = input_with_params();
        let cfg = StreamConfig(json!({"port": 1000}));
        let mut overrides = BTreeMap::new();
        overrides.insert("port".to_string(), "2000".to_string());

        let args = assemble_params(&input, Some(&cfg), &overrides).unwrap();
        assert_eq!(args, vec![("--port".to_string(), "2000".to_string())]);
    }

    #[test]
    fn test_missing_required_fails() {
        let input = input_with_params();
        let err = assemble_params(&input, None, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ManifoldError::BadRequest(_)));
    }

    #[test]
    fn test_untyped_optional_keeps_empty_sentinel() {
        let input = input_with_params();
        let cfg = StreamConfig(json!({"port": 1000, "realtime": "1"}));
        let args = assemble_params(&input, Some(&cfg), &BTreeMap::new()).unwrap();
        // The realtime flag is untyped: its value collapses to the empty
        // string and it is emitted as a bare flag.
        assert_eq!(
            args,
            vec![
                ("--port".to_string(), "1000".to_string()),
                ("--realtime".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_absent_optional_not_passed() {
        let input = input_with_params();
        let cfg = StreamConfig(json!({"port": 1000}));
        let args = assemble_params(&input, Some(&cfg), &BTreeMap::new()).unwrap();
        assert_eq!(args.len(), 1);
    }
}

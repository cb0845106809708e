// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Capability snapshot model.
//!
//! The controller serializes one [`Capabilities`] value onto the `MstCapa`
//! page. Inputs are matched against source URIs through their
//! [`InputDescriptor`]s; outputs use their [`ConnectorDescriptor`]'s codec
//! templates to compute default track selections.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Snapshot of everything the host can run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub inputs: Vec<InputDescriptor>,
    #[serde(default)]
    pub connectors: Vec<ConnectorDescriptor>,
}

impl Capabilities {
    pub fn connector(&self, name: &str) -> Option<&ConnectorDescriptor> {
        self.connectors.iter().find(|c| c.name == name)
    }
}

/// One runnable input implementation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputDescriptor {
    /// Name suffix of the input binary (`mf-in-<name>`).
    pub name: String,
    /// Glob patterns with a single `*` that this input accepts.
    #[serde(default)]
    pub source_match: Vec<String>,
    /// Higher priority wins; equal priority keeps the lowest descriptor
    /// index.
    #[serde(default)]
    pub priority: i64,
    /// When set, this input only matches for providers.
    #[serde(default, rename = "non-provider")]
    pub non_provider: bool,
    /// Parameters that must be resolvable for a start to proceed, keyed by
    /// parameter name.
    #[serde(default)]
    pub required: BTreeMap<String, ParamDescriptor>,
    /// Parameters passed only when a value is present.
    #[serde(default)]
    pub optional: BTreeMap<String, ParamDescriptor>,
}

/// One configurable parameter of an input or connector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamDescriptor {
    /// The command-line option this parameter maps onto (`--port`).
    pub option: String,
    /// Value type (`str`, `uint`, `debug`, ...). A missing type marks a
    /// flag-style parameter whose value is forced to the empty string.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

/// One output connector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectorDescriptor {
    /// Name suffix of the output binary (`mf-out-<name>`).
    pub name: String,
    /// Codec-combination templates: the outer list enumerates templates,
    /// each template lists selection groups, each group lists acceptable
    /// entries. An entry prefixed `@` matches by track kind instead of
    /// codec; a `+` prefix selects every matching track instead of one.
    #[serde(default)]
    pub codecs: Vec<Vec<Vec<String>>>,
    /// Per-codec user-agent rules, keyed `codec:<name>`.
    #[serde(default)]
    pub exceptions: BTreeMap<String, Vec<UaException>>,
    /// Push target patterns this connector can write to.
    #[serde(default)]
    pub push_urls: Vec<String>,
}

/// A user-agent rule for one codec.
///
/// A blacklist rule forbids the codec when any substring matches the user
/// agent; a whitelist rule forbids it when none do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UaException {
    #[serde(default)]
    pub blacklist: bool,
    #[serde(default)]
    pub matches: Vec<String>,
}

impl UaException {
    /// Whether the codec stays usable for the given user agent under this
    /// rule.
    pub fn allows(&self, user_agent: &str) -> bool {
        let hit = self.matches.iter().any(|m| user_agent.contains(m.as_str()));
        if self.blacklist {
            !hit
        } else {
            hit
        }
    }
}

/// Applies all rules for one codec. Every rule must allow the user agent.
pub fn codec_allowed(
    exceptions: &BTreeMap<String, Vec<UaException>>,
    codec: &str,
    user_agent: &str,
) -> bool {
    exceptions
        .get(&format!("codec:{codec}"))
        .is_none_or(|rules| rules.iter().all(|r| r.allows(user_agent)))
}

//! Configuration document model.
//!
//! The daemon is wired from one structured document: named nodes, a list of
//! paths referencing them, and a few global knobs. Node sub-schemas depend on
//! the node type; type-specific fields stay as raw JSON and are parsed by the
//! node implementation itself.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::signal::SignalsSpec;

fn default_true() -> bool {
    true
}

fn default_vectorize() -> usize {
    1
}

fn default_queuelen() -> usize {
    64
}

fn default_stats() -> f64 {
    1.0
}

/// A field accepting either one string or a list of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

impl Default for OneOrMany {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectionConfig {
    /// Signal list shape; nodes that provide their own signals must leave
    /// this unset.
    pub signals: Option<SignalsSpec>,
    #[serde(default)]
    pub hooks: Vec<serde_json::Value>,
    #[serde(default = "default_vectorize")]
    pub vectorize: usize,
    /// Auto-insert builtin hooks ahead of user hooks.
    #[serde(default = "default_true")]
    pub builtin: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for DirectionConfig {
    fn default() -> Self {
        DirectionConfig {
            signals: None,
            hooks: Vec::new(),
            vectorize: default_vectorize(),
            builtin: true,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "in", default)]
    pub input: DirectionConfig,
    #[serde(rename = "out", default)]
    pub output: DirectionConfig,
    /// Node-type specific settings, handed to the node implementation.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathModeConfig {
    #[default]
    Any,
    All,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathConfig {
    /// Mapping entries: `node`, `node.data[3-7]`, `node.hdr.sequence`, ...
    #[serde(rename = "in")]
    pub input: OneOrMany,
    /// Destination node names.
    #[serde(rename = "out", default)]
    pub output: OneOrMany,
    #[serde(default)]
    pub hooks: Vec<serde_json::Value>,
    #[serde(default)]
    pub mode: PathModeConfig,
    #[serde(default = "default_vectorize")]
    pub vectorize: usize,
    #[serde(default = "default_queuelen")]
    pub queuelen: usize,
    /// Bounds the poll timeout of source reads; 0 leaves the default.
    #[serde(default)]
    pub rate: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Generate the mirrored return path as well.
    #[serde(default)]
    pub reverse: bool,
    /// Keep upstream sequence numbers instead of the path counter.
    #[serde(default)]
    pub original_sequence_no: bool,
    #[serde(default = "default_true")]
    pub builtin: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub nodes: HashMap<String, NodeConfig>,
    #[serde(default)]
    pub paths: Vec<PathConfig>,
    /// Interval of the periodic statistics task in seconds; 0 disables it.
    #[serde(default = "default_stats")]
    pub stats: f64,
    /// Reserve hugepage-backed pool memory when supported.
    #[serde(default)]
    pub hugepages: usize,
}

impl Config {
    pub fn from_str(s: &str) -> Result<Config> {
        serde_json::from_str(s).map_err(|e| Error::config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::config(format!("{}: {}", path.as_ref().display(), e)))?;
        Config::from_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_document() {
        let cfg = Config::from_str(
            r#"{
                "nodes": {
                    "sig": { "type": "signal", "signal": "sine", "rate": 100.0, "values": 3 },
                    "lo": { "type": "loopback", "queuelen": 16,
                            "in": { "signals": { "count": 3, "type": "float" }, "vectorize": 4 } }
                },
                "paths": [
                    { "in": "sig", "out": "lo", "mode": "any", "queuelen": 32 },
                    { "in": ["sig.data[0-1]", "lo.hdr.sequence"], "out": ["lo"], "mode": "all" }
                ],
                "stats": 2.5,
                "hugepages": 4
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.nodes.len(), 2);
        assert_eq!(cfg.paths.len(), 2);
        assert_eq!(cfg.stats, 2.5);
        assert_eq!(cfg.hugepages, 4);

        let lo = &cfg.nodes["lo"];
        assert_eq!(lo.kind, "loopback");
        assert_eq!(lo.input.vectorize, 4);
        assert!(lo.input.builtin);
        assert_eq!(lo.extra["queuelen"], 16);

        assert_eq!(cfg.paths[0].input.clone().into_vec(), vec!["sig"]);
        assert_eq!(cfg.paths[0].queuelen, 32);
        assert_eq!(cfg.paths[1].mode, PathModeConfig::All);
        assert_eq!(cfg.paths[1].input.clone().into_vec().len(), 2);
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::from_str(
            r#"{ "nodes": { "n": { "type": "loopback" } },
                 "paths": [ { "in": "n" } ] }"#,
        )
        .unwrap();

        let p = &cfg.paths[0];
        assert_eq!(p.mode, PathModeConfig::Any);
        assert_eq!(p.vectorize, 1);
        assert_eq!(p.queuelen, 64);
        assert!(p.enabled);
        assert!(!p.reverse);
        assert!(!p.original_sequence_no);
        assert!(p.output.clone().into_vec().is_empty());
        assert_eq!(cfg.stats, 1.0);
    }

    #[test]
    fn test_malformed_document() {
        assert!(Config::from_str("{ nodes: }").is_err());
    }
}

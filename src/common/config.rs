//! Configuration for a blobkv server
//!
//! The on-disk format is a JSON object with two fields:
//!
//! ```json
//! {
//!   "backends": {
//!     "blobs": {"backend-type": "filesystem", "backend-args": {"path": "blobs"}},
//!     "metadb": {"backend-type": "filesystem", "backend-args": {"path": "metadb"}}
//!   },
//!   "router": [
//!     [["if-meta", "if-host-home"], "metadb"],
//!     ["default", "blobs"]
//!   ]
//! }
//! ```
//!
//! Each router rule is a two-element array: a predicate (or an array of
//! predicates that must all hold) and the name of a backend declared in
//! `backends`. Rules are evaluated in order; first match wins.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::router::Predicate;

/// Global configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backend name → construction parameters.
    pub backends: HashMap<String, BackendConfig>,

    /// Ordered routing rules.
    pub router: Vec<RuleConfig>,

    /// Host used when evaluating `if-host-*` rules for locally
    /// originated requests.
    #[serde(default)]
    pub host: String,
}

/// How to build one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// `"filesystem"` or `"in-memory"`.
    #[serde(rename = "backend-type")]
    pub backend_type: String,

    /// Backend-specific arguments (e.g. `path` for `filesystem`).
    #[serde(rename = "backend-args", default)]
    pub backend_args: serde_json::Map<String, serde_json::Value>,
}

/// One routing rule: `[predicate-or-predicates, backend-name]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig(pub PredicateConfig, pub String);

/// A single predicate string or a conjunction of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PredicateConfig {
    One(String),
    All(Vec<String>),
}

impl PredicateConfig {
    /// View the predicate strings uniformly.
    pub fn as_slice(&self) -> &[String] {
        match self {
            PredicateConfig::One(p) => std::slice::from_ref(p),
            PredicateConfig::All(ps) => ps,
        }
    }
}

impl Config {
    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| crate::Error::InvalidConfig(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// A single in-memory backend catching every request. Used by tests
    /// and embedding callers that don't care about routing.
    pub fn single_memory_backend() -> Self {
        let mut backends = HashMap::new();
        backends.insert(
            "blobs".to_string(),
            BackendConfig {
                backend_type: "in-memory".to_string(),
                backend_args: serde_json::Map::new(),
            },
        );
        Config {
            backends,
            router: vec![RuleConfig(
                PredicateConfig::One("default".to_string()),
                "blobs".to_string(),
            )],
            host: String::new(),
        }
    }

    /// Validate the configuration: every rule must reference a declared
    /// backend and carry only well-formed predicates.
    pub fn validate(&self) -> crate::Result<()> {
        if self.router.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "router needs at least one rule".into(),
            ));
        }
        for rule in &self.router {
            if !self.backends.contains_key(&rule.1) {
                return Err(crate::Error::InvalidConfig(format!(
                    "rule references unknown backend {:?}",
                    rule.1
                )));
            }
            if rule.0.as_slice().is_empty() {
                return Err(crate::Error::InvalidConfig(
                    "rule with an empty predicate list".into(),
                ));
            }
            for pred in rule.0.as_slice() {
                pred.parse::<Predicate>()?;
            }
        }
        Ok(())
    }
}

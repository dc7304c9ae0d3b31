//! Rule-driven request routing
//!
//! Every blob operation carries a [`Request`] fingerprint (read/write,
//! meta flag, host). The router walks an ordered rule list and dispatches
//! to the first backend whose predicates all match. Routing is a pure
//! function of the fingerprint and the rule list; the rule list and the
//! backend table are read-only after startup.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::backend::{BlobBackend, EnumerateSink};
use crate::common::{Error, Result, RuleConfig};

/// Whether a request reads or writes blob data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Read,
    Write,
}

/// Routing fingerprint of a blob operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub req_type: RequestType,
    /// Whether the blob is a meta blob.
    pub meta_blob: bool,
    pub host: String,
}

impl Request {
    pub fn read(meta_blob: bool, host: &str) -> Self {
        Request {
            req_type: RequestType::Read,
            meta_blob,
            host: host.to_string(),
        }
    }

    pub fn write(meta_blob: bool, host: &str) -> Self {
        Request {
            req_type: RequestType::Write,
            meta_blob,
            host: host.to_string(),
        }
    }

    fn with_type(&self, req_type: RequestType) -> Request {
        Request {
            req_type,
            meta_blob: self.meta_blob,
            host: self.host.clone(),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[request type={:?}, meta={}, host={}]",
            self.req_type, self.meta_blob, self.host
        )
    }
}

/// A parsed routing predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Always true.
    Default,
    /// True when the request concerns a meta blob.
    IfMeta,
    /// True when the request host equals this host (case-insensitive).
    IfHost(String),
}

impl FromStr for Predicate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(Predicate::Default),
            "if-meta" => Ok(Predicate::IfMeta),
            _ => {
                if let Some(host) = s.strip_prefix("if-host-") {
                    Ok(Predicate::IfHost(host.to_string()))
                } else {
                    Err(Error::BadRule(s.to_string()))
                }
            }
        }
    }
}

impl Predicate {
    /// Evaluate against a request fingerprint.
    pub fn matches(&self, req: &Request) -> bool {
        match self {
            Predicate::Default => true,
            Predicate::IfMeta => req.meta_blob,
            Predicate::IfHost(host) => req.host.eq_ignore_ascii_case(host),
        }
    }
}

/// One rule: a predicate conjunction and the backend it selects.
#[derive(Debug, Clone)]
pub struct Rule {
    predicates: Vec<Predicate>,
    backend: String,
}

impl Rule {
    fn matches(&self, req: &Request) -> bool {
        self.predicates.iter().all(|p| p.matches(req))
    }
}

/// The router: ordered rules plus the backend registry.
pub struct Router {
    rules: Vec<Rule>,
    backends: HashMap<String, Arc<dyn BlobBackend>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("rules", &self.rules)
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Router {
    /// Parse the rule list. Unknown predicates fail here, before any
    /// request is routed.
    pub fn from_config(rules: &[RuleConfig]) -> Result<Self> {
        let mut parsed = Vec::with_capacity(rules.len());
        for rule in rules {
            let predicates = rule
                .0
                .as_slice()
                .iter()
                .map(|p| p.parse())
                .collect::<Result<Vec<Predicate>>>()?;
            if predicates.is_empty() {
                return Err(Error::BadRule("empty predicate list".into()));
            }
            parsed.push(Rule {
                predicates,
                backend: rule.1.clone(),
            });
        }
        Ok(Router {
            rules: parsed,
            backends: HashMap::new(),
        })
    }

    /// Register a backend under its key.
    pub fn register(&mut self, name: &str, backend: Arc<dyn BlobBackend>) {
        self.backends.insert(name.to_string(), backend);
    }

    /// The distinct backend keys referenced across all rules, in rule
    /// order. The orchestrator instantiates exactly these.
    pub fn resolve_backends(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for rule in &self.rules {
            if !seen.contains(&rule.backend) {
                seen.push(rule.backend.clone());
            }
        }
        seen
    }

    /// Walk the rules in order and return the first matching backend
    /// key, or `None` when no rule matched.
    pub fn route(&self, req: &Request) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.matches(req))
            .map(|rule| rule.backend.as_str())
    }

    fn backend_for(&self, req: &Request) -> Result<&Arc<dyn BlobBackend>> {
        let key = self
            .route(req)
            .ok_or_else(|| Error::UnknownBackend(format!("no rule matched {}", req)))?;
        self.backends
            .get(key)
            .ok_or_else(|| Error::UnknownBackend(key.to_string()))
    }

    /// Route a write and store the blob on the selected backend.
    pub fn put(&self, req: &Request, hash: &str, data: &[u8]) -> Result<()> {
        self.backend_for(&req.with_type(RequestType::Write))?
            .put(hash, data)
    }

    /// Route a read and fetch the blob from the selected backend.
    pub fn get(&self, req: &Request, hash: &str) -> Result<Vec<u8>> {
        self.backend_for(&req.with_type(RequestType::Read))?.get(hash)
    }

    /// Route a read and check existence on the selected backend.
    pub fn exists(&self, req: &Request, hash: &str) -> Result<bool> {
        self.backend_for(&req.with_type(RequestType::Read))?
            .exists(hash)
    }

    /// Route a read and enumerate the selected backend.
    pub fn enumerate(&self, req: &Request, sink: &mut EnumerateSink<'_>) -> Result<()> {
        self.backend_for(&req.with_type(RequestType::Read))?
            .enumerate(sink)
    }

    /// Checkpoint every registered backend.
    pub fn done(&self) -> Result<()> {
        for backend in self.backends.values() {
            backend.done()?;
        }
        Ok(())
    }

    /// Close every registered backend.
    pub fn close(&self) -> Result<()> {
        for backend in self.backends.values() {
            backend.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PredicateConfig;

    fn rules(raw: &[(&[&str], &str)]) -> Vec<RuleConfig> {
        raw.iter()
            .map(|(preds, backend)| {
                RuleConfig(
                    PredicateConfig::All(preds.iter().map(|p| p.to_string()).collect()),
                    backend.to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn test_first_match_wins() {
        let router = Router::from_config(&rules(&[
            (&["if-meta", "if-host-srva"], "x"),
            (&["default"], "y"),
        ]))
        .unwrap();

        assert_eq!(router.route(&Request::write(true, "srvA")), Some("x"));
        assert_eq!(router.route(&Request::write(true, "srvB")), Some("y"));
        assert_eq!(router.route(&Request::read(false, "srvA")), Some("y"));
    }

    #[test]
    fn test_no_rule_matched() {
        let router =
            Router::from_config(&rules(&[(&["if-host-elsewhere"], "x")])).unwrap();
        assert_eq!(router.route(&Request::read(false, "here")), None);
    }

    #[test]
    fn test_host_compare_is_case_insensitive() {
        let router = Router::from_config(&rules(&[(&["if-host-Home"], "x")])).unwrap();
        assert_eq!(router.route(&Request::read(false, "hOmE")), Some("x"));
        assert_eq!(router.route(&Request::read(false, "office")), None);
    }

    #[test]
    fn test_unknown_predicate_is_rejected_at_parse() {
        let err = Router::from_config(&rules(&[(&["if-full-moon"], "x")])).unwrap_err();
        assert!(matches!(err, Error::BadRule(_)));
    }

    #[test]
    fn test_resolve_backends_dedups_in_rule_order() {
        let router = Router::from_config(&rules(&[
            (&["if-meta"], "meta"),
            (&["if-host-a"], "blobs"),
            (&["default"], "blobs"),
        ]))
        .unwrap();
        assert_eq!(router.resolve_backends(), vec!["meta", "blobs"]);
    }

    #[test]
    fn test_routing_is_deterministic() {
        let router = Router::from_config(&rules(&[
            (&["if-meta"], "meta"),
            (&["default"], "blobs"),
        ]))
        .unwrap();
        let req = Request::write(true, "anywhere");
        let first = router.route(&req).map(str::to_string);
        for _ in 0..10 {
            assert_eq!(router.route(&req).map(str::to_string), first);
        }
    }

    #[test]
    fn test_unregistered_backend_surfaces_error() {
        let router = Router::from_config(&rules(&[(&["default"], "ghost")])).unwrap();
        let err = router
            .put(&Request::write(false, ""), &"ab".repeat(20), b"x")
            .unwrap_err();
        assert!(matches!(err, Error::UnknownBackend(_)));
    }
}

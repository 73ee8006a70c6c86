//! Backend routing
//!
//! Picks the backend that runs a container from declarative rules. A rule
//! matches when its mask matches the whole container id AND every namespace
//! it requires is present with an equal value. The highest priority wins;
//! on a tie the rule declared first wins.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::{Error, Result};

fn default_mask() -> String {
    ".*".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub backend: BackendKind,
    #[serde(default)]
    pub namespaces: BTreeMap<String, String>,
    #[serde(default = "default_mask")]
    pub container_mask: String,
    #[serde(default)]
    pub priority: i32,
}

impl RoutingRule {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            namespaces: BTreeMap::new(),
            container_mask: default_mask(),
            priority: 0,
        }
    }

    pub fn mask(mut self, mask: impl Into<String>) -> Self {
        self.container_mask = mask.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn namespace(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.namespaces.insert(name.into(), value.into());
        self
    }
}

/// Matches container ids against a rule mask
pub trait PatternMatcher: Send + Sync {
    fn is_match(&self, id: &str) -> bool;
}

/// Builds a matcher for a mask, or explains why the mask is unusable
pub type MatcherFactory = dyn Fn(&str) -> std::result::Result<Box<dyn PatternMatcher>, String> + Send + Sync;

/// Regex mask anchored to the whole id
pub struct RegexMatcher {
    regex: Regex,
}

impl RegexMatcher {
    pub fn compile(mask: &str) -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(&format!("^(?:{})$", mask))?,
        })
    }
}

impl PatternMatcher for RegexMatcher {
    fn is_match(&self, id: &str) -> bool {
        self.regex.is_match(id)
    }
}

fn regex_factory(mask: &str) -> std::result::Result<Box<dyn PatternMatcher>, String> {
    RegexMatcher::compile(mask)
        .map(|m| Box::new(m) as Box<dyn PatternMatcher>)
        .map_err(|e| e.to_string())
}

struct CompiledRule {
    rule: RoutingRule,
    /// `None` when the mask failed to compile; the rule never matches
    matcher: Option<Box<dyn PatternMatcher>>,
}

impl CompiledRule {
    fn matches(&self, id: &str, namespaces: &BTreeMap<String, String>) -> bool {
        let Some(ref matcher) = self.matcher else {
            return false;
        };
        matcher.is_match(id)
            && self
                .rule
                .namespaces
                .iter()
                .all(|(name, value)| namespaces.get(name) == Some(value))
    }
}

pub struct Router {
    rules: RwLock<Arc<Vec<CompiledRule>>>,
    default_runtime: Option<BackendKind>,
    factory: Box<MatcherFactory>,
}

impl Router {
    /// Create a router using regex masks
    pub fn new(rules: Vec<RoutingRule>, default_runtime: Option<BackendKind>) -> Self {
        Self::with_matcher(rules, default_runtime, Box::new(regex_factory))
    }

    /// Create a router with a custom mask engine
    pub fn with_matcher(
        rules: Vec<RoutingRule>,
        default_runtime: Option<BackendKind>,
        factory: Box<MatcherFactory>,
    ) -> Self {
        let compiled = compile(&factory, rules);
        Self {
            rules: RwLock::new(Arc::new(compiled)),
            default_runtime,
            factory,
        }
    }

    /// Replace the whole rule set atomically
    pub fn reload(&self, rules: Vec<RoutingRule>) {
        let compiled = Arc::new(compile(&self.factory, rules));
        let count = compiled.len();
        *self.rules.write() = compiled;
        tracing::info!(rules = count, "Routing rules reloaded");
    }

    /// Pick the backend for a container
    pub fn select(&self, id: &str, namespaces: &BTreeMap<String, String>) -> Result<BackendKind> {
        let rules = self.rules.read().clone();

        let mut best: Option<&CompiledRule> = None;
        for rule in rules.iter().filter(|r| r.matches(id, namespaces)) {
            // Strictly greater keeps the first-declared rule on ties
            if best.map_or(true, |b| rule.rule.priority > b.rule.priority) {
                best = Some(rule);
            }
        }

        match (best, self.default_runtime) {
            (Some(rule), _) => {
                tracing::debug!(
                    container = %id,
                    backend = %rule.rule.backend,
                    priority = rule.rule.priority,
                    mask = %rule.rule.container_mask,
                    "Routing rule matched"
                );
                Ok(rule.rule.backend)
            }
            (None, Some(default)) => {
                tracing::debug!(container = %id, backend = %default, "No rule matched, using default runtime");
                Ok(default)
            }
            (None, None) => Err(Error::NoMatchingBackend(id.to_string())),
        }
    }

    /// Current rules, in declaration order
    pub fn rules(&self) -> Vec<RoutingRule> {
        self.rules.read().iter().map(|r| r.rule.clone()).collect()
    }

    /// Number of rules disabled because their mask failed to compile
    pub fn disabled_count(&self) -> usize {
        self.rules.read().iter().filter(|r| r.matcher.is_none()).count()
    }

    pub fn default_runtime(&self) -> Option<BackendKind> {
        self.default_runtime
    }
}

fn compile(factory: &MatcherFactory, rules: Vec<RoutingRule>) -> Vec<CompiledRule> {
    rules
        .into_iter()
        .enumerate()
        .map(|(index, rule)| {
            let matcher = match factory(&rule.container_mask) {
                Ok(m) => Some(m),
                Err(e) => {
                    tracing::warn!(
                        rule = index,
                        mask = %rule.container_mask,
                        backend = %rule.backend,
                        error = %e,
                        "Invalid container mask, rule disabled"
                    );
                    None
                }
            };
            CompiledRule { rule, matcher }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_highest_priority_wins_regardless_of_order() {
        let rules = vec![
            RoutingRule::new(BackendKind::Lxc).mask("web-.*").priority(5),
            RoutingRule::new(BackendKind::ProxmoxVm).mask("web-.*").priority(10),
        ];
        let router = Router::new(rules.clone(), None);
        assert_eq!(router.select("web-1", &ns(&[])).unwrap(), BackendKind::ProxmoxVm);

        let reversed: Vec<_> = rules.into_iter().rev().collect();
        let router = Router::new(reversed, None);
        assert_eq!(router.select("web-1", &ns(&[])).unwrap(), BackendKind::ProxmoxVm);
    }

    #[test]
    fn test_tie_goes_to_first_declared() {
        let router = Router::new(
            vec![
                RoutingRule::new(BackendKind::Crun).priority(3),
                RoutingRule::new(BackendKind::Lxc).priority(3),
            ],
            None,
        );
        assert_eq!(router.select("anything", &ns(&[])).unwrap(), BackendKind::Crun);
    }

    #[test]
    fn test_fallback_to_default_runtime() {
        let router = Router::new(
            vec![RoutingRule::new(BackendKind::Crun).mask("oci-.*")],
            Some(BackendKind::ProxmoxLxc),
        );
        assert_eq!(router.select("pod-web", &ns(&[])).unwrap(), BackendKind::ProxmoxLxc);
    }

    #[test]
    fn test_no_default_is_an_error() {
        let router = Router::new(vec![RoutingRule::new(BackendKind::Crun).mask("oci-.*")], None);
        let err = router.select("pod-web", &ns(&[])).unwrap_err();
        assert!(matches!(err, Error::NoMatchingBackend(_)));
    }

    #[test]
    fn test_namespaces_use_and_semantics() {
        let router = Router::new(
            vec![RoutingRule::new(BackendKind::ProxmoxVm)
                .namespace("isolation", "vm")
                .namespace("tenant", "acme")
                .priority(1)],
            Some(BackendKind::Lxc),
        );
        assert_eq!(
            router.select("c1", &ns(&[("isolation", "vm")])).unwrap(),
            BackendKind::Lxc
        );
        assert_eq!(
            router.select("c1", &ns(&[("isolation", "vm"), ("tenant", "other")])).unwrap(),
            BackendKind::Lxc
        );
        assert_eq!(
            router
                .select("c1", &ns(&[("isolation", "vm"), ("tenant", "acme"), ("extra", "x")]))
                .unwrap(),
            BackendKind::ProxmoxVm
        );
    }

    #[test]
    fn test_mask_matches_whole_id() {
        let router = Router::new(vec![RoutingRule::new(BackendKind::Crun).mask("oci")], Some(BackendKind::Lxc));
        assert_eq!(router.select("oci", &ns(&[])).unwrap(), BackendKind::Crun);
        assert_eq!(router.select("my-oci-box", &ns(&[])).unwrap(), BackendKind::Lxc);
    }

    #[test]
    fn test_malformed_mask_disables_only_that_rule() {
        let router = Router::new(
            vec![
                RoutingRule::new(BackendKind::ProxmoxVm).mask("web-(").priority(100),
                RoutingRule::new(BackendKind::Crun).mask("web-.*").priority(1),
            ],
            None,
        );
        assert_eq!(router.disabled_count(), 1);
        assert_eq!(router.select("web-1", &ns(&[])).unwrap(), BackendKind::Crun);
    }

    #[test]
    fn test_reload_replaces_rules() {
        let router = Router::new(vec![RoutingRule::new(BackendKind::Crun)], None);
        assert_eq!(router.select("x", &ns(&[])).unwrap(), BackendKind::Crun);

        router.reload(vec![RoutingRule::new(BackendKind::Lxc)]);
        assert_eq!(router.select("x", &ns(&[])).unwrap(), BackendKind::Lxc);
        assert_eq!(router.rules().len(), 1);
    }

    struct PrefixMatcher(String);

    impl PatternMatcher for PrefixMatcher {
        fn is_match(&self, id: &str) -> bool {
            id.starts_with(&self.0)
        }
    }

    #[test]
    fn test_custom_matcher_engine() {
        let router = Router::with_matcher(
            vec![RoutingRule::new(BackendKind::Crun).mask("oci")],
            Some(BackendKind::Lxc),
            Box::new(|mask: &str| {
                Ok::<_, String>(Box::new(PrefixMatcher(mask.to_string())) as Box<dyn PatternMatcher>)
            }),
        );
        assert_eq!(router.select("oci-nginx", &ns(&[])).unwrap(), BackendKind::Crun);
    }
}

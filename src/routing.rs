//! Routing rules: ordered mappings from a local path prefix to an upstream URL

use crate::error::{FixtureError, Result};

/// A single forward-proxy mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    /// Incoming path prefix, e.g. `/api/`
    pub source: String,
    /// Destination URL, e.g. `http://upstream:9000/`
    pub destination: String,
}

impl RoutingRule {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }
}

/// Insertion-ordered set of routing rules with unique source prefixes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyRules {
    rules: Vec<RoutingRule>,
}

impl ProxyRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule; a source prefix that is already mapped is a configuration error
    pub fn insert(&mut self, source: impl Into<String>, destination: impl Into<String>) -> Result<()> {
        let rule = RoutingRule::new(source, destination);
        if self.rules.iter().any(|r| r.source == rule.source) {
            return Err(FixtureError::DuplicateRoute {
                source_prefix: rule.source,
            });
        }
        self.rules.push(rule);
        Ok(())
    }

    /// Build from pairs, rejecting duplicate sources
    pub fn from_pairs<I, S, D>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, D)>,
        S: Into<String>,
        D: Into<String>,
    {
        let mut rules = Self::new();
        for (source, destination) in pairs {
            rules.insert(source, destination)?;
        }
        Ok(rules)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RoutingRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Expand each rule into directive lines using `directives`, preserving order
    pub fn expand<F>(&self, directives: F) -> Vec<String>
    where
        F: Fn(&RoutingRule) -> Vec<String>,
    {
        self.rules.iter().flat_map(directives).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_preserves_order() {
        let rules = ProxyRules::from_pairs([
            ("/b/", "http://b:1/"),
            ("/a/", "http://a:2/"),
            ("/c/", "http://c:3/"),
        ])
        .unwrap();

        let sources: Vec<_> = rules.iter().map(|r| r.source.as_str()).collect();
        assert_eq!(sources, vec!["/b/", "/a/", "/c/"]);
        assert_eq!(rules.len(), 3);
    }

    #[test]
    fn test_duplicate_source_rejected() {
        let mut rules = ProxyRules::new();
        rules.insert("/api/", "http://one:9000/").unwrap();
        let err = rules.insert("/api/", "http://two:9000/").unwrap_err();
        assert!(matches!(err, FixtureError::DuplicateRoute { ref source_prefix } if source_prefix == "/api/"));
        // First mapping is kept
        assert_eq!(rules.iter().next().unwrap().destination, "http://one:9000/");
    }

    #[test]
    fn test_expand_flattens_in_order() {
        let rules = ProxyRules::from_pairs([("/x/", "http://x/"), ("/y/", "http://y/")]).unwrap();
        let lines = rules.expand(|r| vec![format!("A {}", r.source), format!("B {}", r.destination)]);
        assert_eq!(lines, vec!["A /x/", "B http://x/", "A /y/", "B http://y/"]);
    }

    #[test]
    fn test_empty_rules() {
        let rules = ProxyRules::new();
        assert!(rules.is_empty());
        assert!(rules.expand(|r| vec![r.source.clone()]).is_empty());
    }
}

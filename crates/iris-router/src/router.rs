//! The rule table and match processing.

use std::sync::Arc;

use crate::rule::{Priority, Rule};

/// A rule that matched a processed request.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    /// The matched rule.
    pub rule: Arc<Rule>,
    /// The source pattern that matched the path.
    pub source: String,
    /// Capture groups from the path match (group 0 is the whole match).
    pub params: Vec<Option<String>>,
    /// Capture groups from the host match, when a host pattern applied.
    pub host_params: Option<Vec<Option<String>>>,
}

impl RouteMatch {
    /// Look up a destination entry on the matched rule.
    pub fn destination(&self, key: &str) -> Option<&str> {
        self.rule.destination(key)
    }

    /// The destination service name, when one is configured.
    pub fn service(&self) -> Option<&str> {
        self.destination("service")
    }
}

/// An ordered table of routing rules.
#[derive(Debug, Default)]
pub struct Router {
    rules: Vec<Arc<Rule>>,
}

impl Router {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule to the table.
    ///
    /// Rules are bucketed by priority at processing time; within a
    /// bucket, registration order is preserved.
    pub fn add_rule(&mut self, rule: Rule) -> &mut Self {
        self.rules.push(Arc::new(rule));
        self
    }

    /// All registered rules, registration order.
    pub fn rules(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules.iter()
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Match `path` (and optionally the query string and Host header)
    /// against the table.
    ///
    /// Returns every matching rule, ordered by priority bucket then
    /// registration order. The first source pattern that matches a rule
    /// wins for that rule; when both a query string and a query pattern
    /// are present the query must match too. Host patterns filter the
    /// rule in allow mode (any match admits) or disallow mode (any match
    /// rejects).
    pub fn process(&self, path: &str, query: Option<&str>, host: Option<&str>) -> Vec<RouteMatch> {
        let mut matches = Vec::new();

        for priority in Priority::ALL {
            for rule in self.rules.iter().filter(|r| r.priority() == priority) {
                if let Some(m) = match_rule(rule, path, query, host) {
                    matches.push(m);
                }
            }
        }

        matches
    }
}

fn match_rule(
    rule: &Arc<Rule>,
    path: &str,
    query: Option<&str>,
    host: Option<&str>,
) -> Option<RouteMatch> {
    let mut host_params = None;

    if let Some(host) = host {
        if !rule.hosts().is_empty() {
            // allow mode: any matching pattern admits the host;
            // disallow mode: any matching pattern rejects it
            let mut allowed = rule.host_mode_disallow();
            for pattern in rule.hosts() {
                if let Some(caps) = pattern.captures(host) {
                    allowed = !rule.host_mode_disallow();
                    host_params = Some(captures_to_params(&caps));
                    if rule.host_mode_disallow() {
                        break;
                    }
                }
            }
            if !allowed {
                return None;
            }
        }
    }

    for pattern in rule.sources() {
        let Some(caps) = pattern.captures(path) else {
            continue;
        };

        if let (Some(query), Some(query_pattern)) = (query.filter(|q| !q.is_empty()), rule.query())
        {
            if !query_pattern.is_match(query) {
                continue;
            }
        }

        return Some(RouteMatch {
            rule: Arc::clone(rule),
            source: pattern.as_str().to_string(),
            params: captures_to_params(&caps),
            host_params,
        });
    }

    None
}

fn captures_to_params(caps: &regex::Captures<'_>) -> Vec<Option<String>> {
    caps.iter()
        .map(|c| c.map(|m| m.as_str().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(priority: Priority, source: &str, service: &str) -> Rule {
        Rule::builder()
            .priority(priority)
            .source(source)
            .destination("service", service)
            .build()
            .unwrap()
    }

    #[test]
    fn test_first_match_in_registration_order() {
        let mut router = Router::new();
        router.add_rule(rule(Priority::Normal, "^/a", "first"));
        router.add_rule(rule(Priority::Normal, "^/a", "second"));

        let matches = router.process("/a", None, None);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].service(), Some("first"));
        assert_eq!(matches[1].service(), Some("second"));
    }

    #[test]
    fn test_priority_buckets_processed_top_down() {
        let mut router = Router::new();
        router.add_rule(rule(Priority::Bottom, ".*", "fallback"));
        router.add_rule(rule(Priority::Top, "^/special", "special"));

        let matches = router.process("/special", None, None);
        assert_eq!(matches[0].service(), Some("special"));
        assert_eq!(matches[1].service(), Some("fallback"));
    }

    #[test]
    fn test_no_match_returns_empty() {
        let mut router = Router::new();
        router.add_rule(rule(Priority::Normal, "^/chat$", "chat"));
        assert!(router.process("/other", None, None).is_empty());
    }

    #[test]
    fn test_query_pattern_is_anded() {
        let mut router = Router::new();
        router.add_rule(
            Rule::builder()
                .source("^/feed")
                .query("format=json")
                .destination("service", "json-feed")
                .build()
                .unwrap(),
        );

        assert!(router.process("/feed", Some("format=xml"), None).is_empty());
        assert_eq!(
            router.process("/feed", Some("format=json"), None).len(),
            1
        );
        // an absent query leaves the source match standing
        assert_eq!(router.process("/feed", None, None).len(), 1);
    }

    #[test]
    fn test_host_allow_mode() {
        let mut router = Router::new();
        router.add_rule(
            Rule::builder()
                .source("^/")
                .host(r"^internal\.example\.com$")
                .destination("service", "internal")
                .build()
                .unwrap(),
        );

        assert_eq!(
            router
                .process("/", None, Some("internal.example.com"))
                .len(),
            1
        );
        assert!(router.process("/", None, Some("public.example.com")).is_empty());
        // no host supplied: host patterns do not filter
        assert_eq!(router.process("/", None, None).len(), 1);
    }

    #[test]
    fn test_host_disallow_mode() {
        let mut router = Router::new();
        router.add_rule(
            Rule::builder()
                .source("^/")
                .host(r"^banned\.example\.com$")
                .host_mode_disallow(true)
                .destination("service", "open")
                .build()
                .unwrap(),
        );

        assert!(router
            .process("/", None, Some("banned.example.com"))
            .is_empty());
        assert_eq!(
            router.process("/", None, Some("fine.example.com")).len(),
            1
        );
    }

    #[test]
    fn test_capture_params_exposed() {
        let mut router = Router::new();
        router.add_rule(
            Rule::builder()
                .source(r"^/room/(\d+)$")
                .destination("service", "rooms")
                .build()
                .unwrap(),
        );

        let matches = router.process("/room/42", None, None);
        assert_eq!(matches[0].params[1].as_deref(), Some("42"));
    }

    #[test]
    fn test_first_matching_source_wins_within_rule() {
        let mut router = Router::new();
        router.add_rule(
            Rule::builder()
                .source("^/a$")
                .source("^/b$")
                .destination("service", "ab")
                .build()
                .unwrap(),
        );

        let matches = router.process("/b", None, None);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].source, "^/b$");
    }
}

//! Routing rules and their builder.

use std::collections::HashMap;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

/// Errors raised while building a rule.
#[derive(Debug, Error)]
pub enum RuleError {
    /// A rule needs at least one source pattern.
    #[error("rule has no source pattern")]
    MissingSource,

    /// A rule needs at least one destination entry.
    #[error("rule has no destination")]
    MissingDestination,

    /// A pattern failed to compile.
    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// The regex compile error.
        source: regex::Error,
    },

    /// An unknown priority name in a rule spec.
    #[error("unhandled priority name: {0:?}")]
    UnknownPriority(String),
}

/// Rule priority bucket. Buckets are processed top to bottom; rules
/// within a bucket keep their registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Processed first.
    Top,
    /// Above high.
    VeryHigh,
    /// High priority.
    High,
    /// The default bucket.
    #[default]
    Normal,
    /// Low priority.
    Low,
    /// Below low.
    VeryLow,
    /// Processed last.
    Bottom,
}

impl Priority {
    /// All buckets, in processing order.
    pub const ALL: [Self; 7] = [
        Self::Top,
        Self::VeryHigh,
        Self::High,
        Self::Normal,
        Self::Low,
        Self::VeryLow,
        Self::Bottom,
    ];

    /// The bucket's canonical name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Top => "TOP",
            Self::VeryHigh => "VERY_HIGH",
            Self::High => "HIGH",
            Self::Normal => "NORMAL",
            Self::Low => "LOW",
            Self::VeryLow => "VERY_LOW",
            Self::Bottom => "BOTTOM",
        }
    }

    /// Parse a bucket from its canonical name.
    pub fn from_str_name(name: &str) -> Option<Self> {
        match name {
            "TOP" => Some(Self::Top),
            "VERY_HIGH" => Some(Self::VeryHigh),
            "HIGH" => Some(Self::High),
            "NORMAL" => Some(Self::Normal),
            "LOW" => Some(Self::Low),
            "VERY_LOW" => Some(Self::VeryLow),
            "BOTTOM" => Some(Self::Bottom),
            _ => None,
        }
    }
}

/// One routing rule.
///
/// Built via [`Rule::builder`]; immutable afterwards.
#[derive(Debug)]
pub struct Rule {
    id: String,
    priority: Priority,
    sources: Vec<Regex>,
    query: Option<Regex>,
    hosts: Vec<Regex>,
    host_mode_disallow: bool,
    destinations: HashMap<String, String>,
    accept_path_info: bool,
    process_next: bool,
}

impl Rule {
    /// Start building a rule.
    pub fn builder() -> RuleBuilder {
        RuleBuilder::default()
    }

    /// The rule id (caller-assigned, or derived from the first source).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The rule's priority bucket.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Source patterns matched against the request path.
    pub fn sources(&self) -> &[Regex] {
        &self.sources
    }

    /// Optional pattern matched against the query string.
    pub fn query(&self) -> Option<&Regex> {
        self.query.as_ref()
    }

    /// Host patterns, if any.
    pub fn hosts(&self) -> &[Regex] {
        &self.hosts
    }

    /// Whether host patterns deny instead of allow.
    pub fn host_mode_disallow(&self) -> bool {
        self.host_mode_disallow
    }

    /// Look up a destination entry, e.g. `"service"`.
    pub fn destination(&self, key: &str) -> Option<&str> {
        self.destinations.get(key).map(String::as_str)
    }

    /// All destination entries.
    pub fn destinations(&self) -> &HashMap<String, String> {
        &self.destinations
    }

    /// Whether trailing path info after the matched prefix is accepted.
    pub fn accept_path_info(&self) -> bool {
        self.accept_path_info
    }

    /// Whether later rules should still be consulted after this matches.
    pub fn process_next(&self) -> bool {
        self.process_next
    }
}

/// Builder for [`Rule`].
#[derive(Debug, Default)]
pub struct RuleBuilder {
    id: Option<String>,
    priority: Priority,
    sources: Vec<String>,
    query: Option<String>,
    hosts: Vec<String>,
    host_mode_disallow: bool,
    destinations: HashMap<String, String>,
    accept_path_info: bool,
    process_next: bool,
}

impl RuleBuilder {
    /// Set an explicit rule id.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the priority bucket.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Add a source pattern matched against the request path.
    pub fn source(mut self, pattern: impl Into<String>) -> Self {
        self.sources.push(pattern.into());
        self
    }

    /// Set the query-string pattern.
    pub fn query(mut self, pattern: impl Into<String>) -> Self {
        self.query = Some(pattern.into());
        self
    }

    /// Add a host pattern.
    pub fn host(mut self, pattern: impl Into<String>) -> Self {
        self.hosts.push(pattern.into());
        self
    }

    /// Make host patterns deny matching hosts instead of allowing them.
    pub fn host_mode_disallow(mut self, disallow: bool) -> Self {
        self.host_mode_disallow = disallow;
        self
    }

    /// Add a destination entry.
    pub fn destination(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.destinations.insert(key.into(), value.into());
        self
    }

    /// Accept trailing path info after the matched prefix.
    pub fn accept_path_info(mut self, accept: bool) -> Self {
        self.accept_path_info = accept;
        self
    }

    /// Keep consulting later rules after this one matches.
    pub fn process_next(mut self, next: bool) -> Self {
        self.process_next = next;
        self
    }

    /// Compile the patterns and produce the rule.
    pub fn build(self) -> Result<Rule, RuleError> {
        if self.sources.is_empty() {
            return Err(RuleError::MissingSource);
        }
        if self.destinations.is_empty() {
            return Err(RuleError::MissingDestination);
        }

        let id = self
            .id
            .unwrap_or_else(|| self.sources.first().cloned().unwrap_or_default());

        Ok(Rule {
            id,
            priority: self.priority,
            sources: compile_all(&self.sources)?,
            query: self.query.as_deref().map(compile).transpose()?,
            hosts: compile_all(&self.hosts)?,
            host_mode_disallow: self.host_mode_disallow,
            destinations: self.destinations,
            accept_path_info: self.accept_path_info,
            process_next: self.process_next,
        })
    }
}

fn compile(pattern: &str) -> Result<Regex, RuleError> {
    Regex::new(pattern).map_err(|source| RuleError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>, RuleError> {
    patterns.iter().map(|p| compile(p)).collect()
}

/// A declarative rule, as read from a config file.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    /// Optional explicit id.
    pub id: Option<String>,
    /// Priority bucket name (`TOP` .. `BOTTOM`), defaults to `NORMAL`.
    pub priority: Option<String>,
    /// Source patterns.
    pub sources: Vec<String>,
    /// Optional query pattern.
    pub query: Option<String>,
    /// Host patterns.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Deny mode for host patterns.
    #[serde(default)]
    pub host_mode_disallow: bool,
    /// Destination map; the server requires a `service` entry.
    pub destination: HashMap<String, String>,
    /// Accept trailing path info.
    #[serde(default)]
    pub accept_path_info: bool,
    /// Keep consulting later rules.
    #[serde(default)]
    pub process_next: bool,
}

impl TryFrom<RuleSpec> for Rule {
    type Error = RuleError;

    fn try_from(spec: RuleSpec) -> Result<Self, Self::Error> {
        let mut builder = Rule::builder();
        if let Some(id) = spec.id {
            builder = builder.id(id);
        }
        if let Some(name) = spec.priority {
            let priority =
                Priority::from_str_name(&name).ok_or(RuleError::UnknownPriority(name))?;
            builder = builder.priority(priority);
        }
        for source in spec.sources {
            builder = builder.source(source);
        }
        if let Some(query) = spec.query {
            builder = builder.query(query);
        }
        for host in spec.hosts {
            builder = builder.host(host);
        }
        builder = builder
            .host_mode_disallow(spec.host_mode_disallow)
            .accept_path_info(spec.accept_path_info)
            .process_next(spec.process_next);
        for (key, value) in spec.destination {
            builder = builder.destination(key, value);
        }
        builder.build()
    }
}

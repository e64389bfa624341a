//! Host scope filtering.
//!
//! Decides which hosts the proxy pipeline processes at all. Filtered hosts
//! are passed through untouched: no history, no interception, no processors.
//!
//! Evaluation order:
//!
//! 1. A host matching any enabled exclude rule is filtered.
//! 2. Otherwise, if the include list has rules, a host matching none of the
//!    enabled include rules is filtered.
//! 3. Everything else is in scope.

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::extract::split_host_port;

/// Scope configuration errors.
#[derive(Debug, Error)]
pub enum ScopeError {
    /// A regexp rule did not compile.
    #[error("invalid scope pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// One include or exclude rule, as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRule {
    /// Hostname, or a regular expression when `regexp` is set.
    pub prefix: String,
    #[serde(default)]
    pub regexp: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ScopeRule {
    /// Exact hostname rule.
    pub fn host(host: impl Into<String>) -> Self {
        Self {
            prefix: host.into(),
            regexp: false,
            enabled: true,
        }
    }

    /// Regular expression rule.
    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            prefix: pattern.into(),
            regexp: true,
            enabled: true,
        }
    }
}

/// Include and exclude rule lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeConfig {
    #[serde(default)]
    pub include: Vec<ScopeRule>,
    #[serde(default)]
    pub exclude: Vec<ScopeRule>,
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact(String),
    Pattern(Regex),
}

impl Matcher {
    fn matches(&self, hostname: &str) -> bool {
        match self {
            Self::Exact(host) => host == hostname,
            Self::Pattern(re) => re.is_match(hostname),
        }
    }
}

/// Compiled scope filter.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    include: Vec<Matcher>,
    exclude: Vec<Matcher>,
}

impl Scope {
    /// A scope that lets every host through.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Compiles a scope configuration. Disabled rules are skipped.
    pub fn compile(config: &ScopeConfig) -> Result<Self, ScopeError> {
        Ok(Self {
            include: compile_rules(&config.include)?,
            exclude: compile_rules(&config.exclude)?,
        })
    }

    /// Returns true if traffic to `address` (host or host:port) should be
    /// left alone.
    pub fn is_filtered(&self, address: &str) -> bool {
        let (hostname, _) = split_host_port(address);

        if self.exclude.iter().any(|m| m.matches(hostname)) {
            return true;
        }
        if !self.include.is_empty() {
            return !self.include.iter().any(|m| m.matches(hostname));
        }
        false
    }

    /// Returns true if no rule is active.
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

fn compile_rules(rules: &[ScopeRule]) -> Result<Vec<Matcher>, ScopeError> {
    rules
        .iter()
        .filter(|rule| rule.enabled)
        .map(|rule| {
            if rule.regexp {
                Regex::new(&rule.prefix)
                    .map(Matcher::Pattern)
                    .map_err(|source| ScopeError::InvalidPattern {
                        pattern: rule.prefix.clone(),
                        source,
                    })
            } else {
                Ok(Matcher::Exact(rule.prefix.clone()))
            }
        })
        .collect()
}

//! Origin classification for intercepted requests.

use tracing::trace;
use url::{Origin, Url};

/// Where a request is headed, relative to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestScope {
    /// Same origin as the worker.
    SameOrigin,
    /// Cross-origin host on the allow-list.
    AllowListed,
    /// Any other cross-origin host.
    Foreign,
}

/// Type of host pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    /// Exact host match.
    Exact,
    /// The host or any subdomain of it.
    Suffix,
}

/// Host pattern for the cross-origin allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern {
    /// Pattern type.
    pub pattern_type: PatternType,
    /// Lowercased host, without any `*.` prefix.
    pub pattern: String,
}

impl HostPattern {
    /// Create an exact host pattern.
    pub fn exact(host: &str) -> Self {
        Self {
            pattern_type: PatternType::Exact,
            pattern: host.to_ascii_lowercase(),
        }
    }

    /// Create a pattern matching a domain and its subdomains.
    pub fn suffix(domain: &str) -> Self {
        Self {
            pattern_type: PatternType::Suffix,
            pattern: domain.to_ascii_lowercase(),
        }
    }

    /// Parse `"*.example.com"` as a suffix pattern, anything else as exact.
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix("*.") {
            Some(domain) => Self::suffix(domain),
            None => Self::exact(raw),
        }
    }

    /// Check if a host matches this pattern.
    pub fn matches(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        match self.pattern_type {
            PatternType::Exact => host == self.pattern,
            PatternType::Suffix => {
                host == self.pattern
                    || host
                        .strip_suffix(&self.pattern)
                        .is_some_and(|rest| rest.ends_with('.'))
            }
        }
    }
}

/// Sorts request URLs by origin relative to the worker.
#[derive(Debug, Clone)]
pub struct OriginClassifier {
    origin: Origin,
    allow: Vec<HostPattern>,
}

impl OriginClassifier {
    /// Create a classifier for a worker served from `origin`.
    pub fn new(origin: &Url) -> Self {
        Self {
            origin: origin.origin(),
            allow: Vec::new(),
        }
    }

    /// Add a cross-origin host pattern to the allow-list.
    pub fn allow(mut self, pattern: HostPattern) -> Self {
        self.allow.push(pattern);
        self
    }

    /// Add several hosts, parsed with [`HostPattern::parse`].
    pub fn allow_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allow
            .extend(hosts.into_iter().map(|h| HostPattern::parse(h.as_ref())));
        self
    }

    /// The worker's own origin.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Classify a request URL.
    pub fn classify(&self, url: &Url) -> RequestScope {
        let scope = if url.origin() == self.origin {
            RequestScope::SameOrigin
        } else {
            match url.host_str() {
                Some(host) if self.allow.iter().any(|p| p.matches(host)) => {
                    RequestScope::AllowListed
                }
                _ => RequestScope::Foreign,
            }
        };
        trace!(url = %url, scope = ?scope, "Classified request");
        scope
    }
}

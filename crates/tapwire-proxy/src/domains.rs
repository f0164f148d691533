//! Target domain filtering.
//!
//! Defines which hosts are captured. Everything else is passed through
//! without inspection or persistence.

use std::collections::BTreeSet;

/// Domains captured when nothing else is configured.
pub const DEFAULT_TARGET_DOMAINS: &[&str] = &["dawn.com", "www.dawn.com"];

/// An immutable set of target domains.
///
/// A host matches when it equals an entry or is a subdomain of one
/// (`news.dawn.com` matches `dawn.com`, `notdawn.com` does not).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetDomains {
    domains: BTreeSet<String>,
}

impl TargetDomains {
    /// Builds a set from domain names; empty and duplicate entries are ignored.
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .map(|d| normalize_host(d.as_ref()))
            .filter(|d| !d.is_empty())
            .collect();

        Self { domains }
    }

    /// The built-in default set.
    pub fn defaults() -> Self {
        Self::new(DEFAULT_TARGET_DOMAINS)
    }

    /// Checks if `host` should be captured.
    ///
    /// # Examples
    ///
    /// ```
    /// use tapwire_proxy::TargetDomains;
    ///
    /// let targets = TargetDomains::new(["dawn.com"]);
    /// assert!(targets.matches("www.dawn.com:443"));
    /// assert!(!targets.matches("example.com"));
    /// ```
    pub fn matches(&self, host: &str) -> bool {
        let host = normalize_host(host);
        if host.is_empty() {
            return false;
        }

        self.domains.iter().any(|domain| {
            host == *domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    /// Number of configured domains.
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    /// Whether no domain is configured.
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Iterates over the configured domains in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(String::as_str)
    }
}

/// Lowercases a host and strips any port and trailing dot.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();

    let host = if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        rest.split(']').next().unwrap_or(rest)
    } else if host.matches(':').count() == 1 {
        host.split(':').next().unwrap_or(host)
    } else {
        host
    };

    host.trim_end_matches('.').to_ascii_lowercase()
}

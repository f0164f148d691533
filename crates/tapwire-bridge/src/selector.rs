//! Agent target selectors.

use std::fmt;
use std::str::FromStr;

use crate::error::BridgeError;

/// Browser processes tried, in order, when no process is named.
pub const DEFAULT_CANDIDATES: &[&str] = &[
    "com.android.chrome",
    "org.mozilla.firefox",
    "com.opera.browser",
];

/// Launched when none of the default candidates is running.
pub const DEFAULT_SPAWN_PROCESS: &str = "com.android.chrome";

/// Where the agent listens and which process it should attach to.
///
/// Written as `[tcp://]host:port[/process]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSelector {
    pub host: String,
    pub port: u16,
    pub process: Option<String>,
    /// Whether the agent may launch a browser when no candidate is running.
    pub spawn: bool,
}

impl TargetSelector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            process: None,
            spawn: true,
        }
    }

    /// Never asks the agent to launch a process.
    pub fn without_spawn(mut self) -> Self {
        self.spawn = false;
        self
    }

    /// Names the process to attach to instead of the default candidates.
    pub fn with_process(mut self, process: impl Into<String>) -> Self {
        self.process = Some(process.into());
        self
    }

    /// Processes to try, in order.
    pub fn candidates(&self) -> Vec<String> {
        match &self.process {
            Some(process) => vec![process.clone()],
            None => DEFAULT_CANDIDATES.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Process to launch once every candidate turned out unavailable.
    ///
    /// Only applies to the default candidates; a named process is never
    /// launched.
    pub fn spawn_fallback(&self) -> Option<&'static str> {
        (self.spawn && self.process.is_none()).then_some(DEFAULT_SPAWN_PROCESS)
    }
}

impl FromStr for TargetSelector {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| BridgeError::InvalidSelector {
            selector: s.to_string(),
            reason: reason.to_string(),
        };

        let rest = s.trim();
        let rest = rest.strip_prefix("tcp://").unwrap_or(rest);
        if rest.contains("://") {
            return Err(invalid("only tcp:// is supported"));
        }

        let (addr, process) = match rest.split_once('/') {
            Some((addr, process)) => (addr, Some(process.trim())),
            None => (rest, None),
        };

        let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;

        let mut selector = TargetSelector::new(host, port);
        if let Some(process) = process.filter(|p| !p.is_empty()) {
            selector = selector.with_process(process);
        }
        Ok(selector)
    }
}

impl fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "tcp://[{}]:{}", self.host, self.port)?;
        } else {
            write!(f, "tcp://{}:{}", self.host, self.port)?;
        }
        if let Some(process) = &self.process {
            write!(f, "/{process}")?;
        }
        Ok(())
    }
}

//! Discovery failures and the port they are reported through.
//!
//! None of these are returned to callers; they suppress publication of a
//! descriptor and are handed to an [`ErrorReporter`].

use std::fmt;

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryErrorKind {
    DidNotSearch,
    DidNotResolve,
    DidRemoveDomain,
    IpNotParsed,
}

impl DiscoveryErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DidNotSearch => "didNotSearch",
            Self::DidNotResolve => "didNotResolve",
            Self::DidRemoveDomain => "didRemoveDomain",
            Self::IpNotParsed => "IPNotParsed",
        }
    }
}

impl fmt::Display for DiscoveryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}")]
pub struct DiscoveryError {
    kind: DiscoveryErrorKind,
    context: Vec<(&'static str, String)>,
}

impl DiscoveryError {
    pub fn new(kind: DiscoveryErrorKind) -> Self {
        Self {
            kind,
            context: Vec::new(),
        }
    }

    pub fn with(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.context.push((key, value.to_string()));
        self
    }

    pub fn kind(&self) -> DiscoveryErrorKind {
        self.kind
    }

    pub fn context(&self) -> &[(&'static str, String)] {
        &self.context
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.context
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Sink for structured discovery errors.
pub trait ErrorReporter: Send + Sync + 'static {
    fn report(&self, error: &DiscoveryError);
}

/// Emits every discovery error as a `warn!` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, error: &DiscoveryError) {
        warn!(kind = %error.kind(), context = ?error.context(), "service discovery failed");
    }
}

//! Port to the OS service-discovery registry.

use std::net::{Ipv4Addr, Ipv6Addr};

use babylink_common::Result;
use tokio::sync::mpsc;

/// A service instance resolved to raw address bytes and a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
    pub instance: String,
    /// Address octets in registry order; only the first one is considered.
    pub addresses: Vec<Vec<u8>>,
    pub port: u16,
}

/// Events a registry emits while a browse is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseEvent {
    Found { instance: String },
    Resolved(ResolvedService),
    ResolveFailed { instance: String, reason: String },
    Removed { instance: String },
    SearchFailed { reason: String },
    DomainRemoved { domain: String },
}

/// Browse-by-type access to a local service registry.
///
/// Resolution of a found instance happens inside the registry and is not
/// bounded by a timeout; callers cancel through [`ServiceBrowser::stop_browse`].
pub trait ServiceBrowser: Send + Sync + 'static {
    fn browse(&self, service_type: &str) -> Result<mpsc::Receiver<BrowseEvent>>;
    fn stop_browse(&self, service_type: &str) -> Result<()>;
}

/// Converts address octets into a numeric host string without any reverse lookup.
pub fn numeric_host(octets: &[u8]) -> Option<String> {
    match octets.len() {
        4 => {
            let bytes: [u8; 4] = octets.try_into().ok()?;
            Some(Ipv4Addr::from(bytes).to_string())
        }
        16 => {
            let bytes: [u8; 16] = octets.try_into().ok()?;
            let v6 = Ipv6Addr::from(bytes);
            Some(match v6.to_ipv4_mapped() {
                Some(v4) => v4.to_string(),
                None => v6.to_string(),
            })
        }
        _ => None,
    }
}

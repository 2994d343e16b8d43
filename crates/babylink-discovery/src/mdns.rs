//! mDNS backends: browsing on the parent side, advertising on the station side.

use std::net::{IpAddr, SocketAddr};

use babylink_common::{DiscoveryConfig, Error, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::browser::{BrowseEvent, ResolvedService, ServiceBrowser};

const EVENT_CAPACITY: usize = 32;

/// [`ServiceBrowser`] backed by an `mdns-sd` daemon.
pub struct MdnsBrowser {
    daemon: ServiceDaemon,
}

impl MdnsBrowser {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(Error::discovery)?;
        Ok(Self { daemon })
    }
}

impl ServiceBrowser for MdnsBrowser {
    fn browse(&self, service_type: &str) -> Result<mpsc::Receiver<BrowseEvent>> {
        let receiver = self.daemon.browse(service_type).map_err(Error::discovery)?;
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let service_type = service_type.to_string();

        tokio::task::spawn_blocking(move || {
            for event in receiver {
                let Some(event) = translate(&service_type, event) else {
                    continue;
                };
                if tx.blocking_send(event).is_err() {
                    break;
                }
            }
            debug!(%service_type, "mdns browse receiver closed");
        });
        Ok(rx)
    }

    fn stop_browse(&self, service_type: &str) -> Result<()> {
        self.daemon
            .stop_browse(service_type)
            .map_err(Error::discovery)
    }
}

impl Drop for MdnsBrowser {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.shutdown() {
            debug!(error = %e, "mdns daemon shutdown failed");
        }
    }
}

fn translate(service_type: &str, event: ServiceEvent) -> Option<BrowseEvent> {
    match event {
        ServiceEvent::ServiceFound(_, fullname) => Some(BrowseEvent::Found {
            instance: instance_name(&fullname, service_type),
        }),
        ServiceEvent::ServiceResolved(info) => Some(BrowseEvent::Resolved(ResolvedService {
            instance: instance_name(info.get_fullname(), service_type),
            addresses: info.get_addresses().iter().map(octets).collect(),
            port: info.get_port(),
        })),
        ServiceEvent::ServiceRemoved(_, fullname) => Some(BrowseEvent::Removed {
            instance: instance_name(&fullname, service_type),
        }),
        _ => None,
    }
}

/// Strips the `.<service_type>` suffix off an mDNS full name.
fn instance_name(fullname: &str, service_type: &str) -> String {
    fullname
        .strip_suffix(service_type)
        .and_then(|rest| rest.strip_suffix('.'))
        .unwrap_or(fullname)
        .to_string()
}

fn octets(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Advertises the station on the local network for as long as it is alive.
pub struct ServiceAdvertiser {
    daemon: ServiceDaemon,
    fullname: String,
}

impl ServiceAdvertiser {
    pub fn register(config: &DiscoveryConfig, listen_addr: SocketAddr) -> Result<Self> {
        if !config.allows_port(listen_addr.port()) {
            warn!(
                port = listen_addr.port(),
                "advertising on a port parents will not accept"
            );
        }

        let daemon = ServiceDaemon::new().map_err(Error::discovery)?;
        let host_ip = if listen_addr.ip().is_unspecified() {
            String::new()
        } else {
            listen_addr.ip().to_string()
        };
        let service_info = ServiceInfo::new(
            &config.service_type,
            &config.instance_name,
            "babylink.local.",
            host_ip,
            listen_addr.port(),
            &[("v", "1")][..],
        )
        .map_err(Error::discovery)?
        .enable_addr_auto();
        let fullname = service_info.get_fullname().to_string();
        daemon.register(service_info).map_err(Error::discovery)?;
        info!(%fullname, port = listen_addr.port(), "advertising station");

        Ok(Self { daemon, fullname })
    }
}

impl Drop for ServiceAdvertiser {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            debug!(error = %e, "mdns unregister failed");
        }
        if let Err(e) = self.daemon.shutdown() {
            debug!(error = %e, "mdns daemon shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_instance_name_strips_service_type() {
        assert_eq!(
            instance_name("Baby Monitor._babymonitor._tcp.local.", "_babymonitor._tcp.local."),
            "Baby Monitor"
        );
        assert_eq!(instance_name("odd-name", "_babymonitor._tcp.local."), "odd-name");
    }

    #[test]
    fn test_octets_lengths() {
        assert_eq!(octets(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5))), vec![192, 168, 1, 5]);
        assert_eq!(octets(&IpAddr::V6(Ipv6Addr::LOCALHOST)).len(), 16);
    }
}

//! Runtime configuration for discovery and sessions.
//!
//! Defaults match the values the baby station advertises. Each field can be
//! overridden from the environment through `from_env()`.

use std::time::Duration;

use crate::helpers::{env_parse, split_list};
use crate::{Error, Result};

/// Port the native baby station listens on.
pub const STATION_WEBSOCKET_PORT: u16 = 10001;
/// Port the alternative baby station build listens on.
pub const ALT_STATION_WEBSOCKET_PORT: u16 = 8080;

pub const DEFAULT_SERVICE_TYPE: &str = "_babymonitor._tcp.local.";
pub const DEFAULT_SERVICE_NAME: &str = "Baby Monitor";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(5);

const SERVICE_TYPE_ENV: &str = "BABYLINK_SERVICE_TYPE";
const SERVICE_NAME_ENV: &str = "BABYLINK_SERVICE_NAME";
const ALLOWED_PORTS_ENV: &str = "BABYLINK_ALLOWED_PORTS";
const ICE_SERVERS_ENV: &str = "BABYLINK_ICE_SERVERS";
const SEARCH_TIMEOUT_ENV: &str = "BABYLINK_SEARCH_TIMEOUT_SECS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Fully qualified mDNS service type, e.g. `_babymonitor._tcp.local.`
    pub service_type: String,
    /// Instance name a parent accepts; other instances of the type are ignored.
    pub instance_name: String,
    /// Exactly one port per station role.
    pub allowed_ports: [u16; 2],
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            instance_name: DEFAULT_SERVICE_NAME.to_string(),
            allowed_ports: [STATION_WEBSOCKET_PORT, ALT_STATION_WEBSOCKET_PORT],
        }
    }
}

impl DiscoveryConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(service_type) = env_parse::<String>(SERVICE_TYPE_ENV)? {
            if !service_type.ends_with('.') {
                return Err(Error::config(format!(
                    "{SERVICE_TYPE_ENV} must be fully qualified (end with '.')"
                )));
            }
            config.service_type = service_type;
        }
        if let Some(name) = env_parse::<String>(SERVICE_NAME_ENV)? {
            config.instance_name = name;
        }
        if let Some(raw) = env_parse::<String>(ALLOWED_PORTS_ENV)? {
            config.allowed_ports = parse_port_pair(&raw)?;
        }
        Ok(config)
    }

    pub fn allows_port(&self, port: u16) -> bool {
        self.allowed_ports.contains(&port)
    }
}

fn parse_port_pair(raw: &str) -> Result<[u16; 2]> {
    let ports = split_list(raw)
        .iter()
        .map(|entry| {
            entry.parse::<u16>().map_err(|e| {
                Error::config(format!("invalid port {entry:?} in {ALLOWED_PORTS_ENV}: {e}"))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    match ports.as_slice() {
        [first, second] => Ok([*first, *second]),
        _ => Err(Error::config(format!(
            "{ALLOWED_PORTS_ENV} must list exactly two ports, got {}",
            ports.len()
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub ice_servers: Vec<String>,
    /// Deadline a parent waits for discovery before giving up.
    pub search_timeout: Duration,
    /// Capacity of the per-session message channels.
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            search_timeout: DEFAULT_SEARCH_TIMEOUT,
            channel_capacity: 64,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(ICE_SERVERS_ENV) {
            config.ice_servers = split_list(&raw);
        }
        if let Some(secs) = env_parse::<u64>(SEARCH_TIMEOUT_ENV)? {
            if secs == 0 {
                return Err(Error::config(format!("{SEARCH_TIMEOUT_ENV} must be positive")));
            }
            config.search_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

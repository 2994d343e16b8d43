//! Local-network discovery of the baby station.
//!
//! [`ServiceResolver`] browses a [`ServiceBrowser`] for the well-known service
//! and publishes the resolved [`ServiceDescriptor`](babylink_common::ServiceDescriptor)
//! on a watch channel. [`MdnsBrowser`] and [`ServiceAdvertiser`] are the mDNS
//! backends for the parent and the station respectively.

#![forbid(unsafe_code)]

pub mod browser;
pub mod error;
pub mod mdns;
pub mod resolver;

pub use browser::{numeric_host, BrowseEvent, ResolvedService, ServiceBrowser};
pub use error::{DiscoveryError, DiscoveryErrorKind, ErrorReporter, TracingReporter};
pub use mdns::{MdnsBrowser, ServiceAdvertiser};
pub use resolver::ServiceResolver;

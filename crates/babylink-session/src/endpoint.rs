//! Where the parent's signaling socket should connect to.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use babylink_common::Result;
use babylink_discovery::ServiceResolver;
use tracing::info;
use url::Url;

#[async_trait]
pub trait EndpointProvider: Send + Sync {
    async fn endpoint(&self) -> Result<Url>;
}

/// A station address given up front.
#[derive(Debug, Clone)]
pub struct FixedEndpoint(pub Url);

#[async_trait]
impl EndpointProvider for FixedEndpoint {
    async fn endpoint(&self) -> Result<Url> {
        Ok(self.0.clone())
    }
}

/// Finds the station on the local network each time an endpoint is needed.
pub struct DiscoveredEndpoint {
    resolver: Arc<ServiceResolver>,
    timeout: Duration,
}

impl DiscoveredEndpoint {
    pub fn new(resolver: Arc<ServiceResolver>, timeout: Duration) -> Self {
        Self { resolver, timeout }
    }
}

#[async_trait]
impl EndpointProvider for DiscoveredEndpoint {
    async fn endpoint(&self) -> Result<Url> {
        let descriptor = self.resolver.find(self.timeout).await?;
        let url = descriptor.websocket_url()?;
        info!(%url, "station discovered");
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use babylink_common::{DiscoveryConfig, Error};
    use babylink_discovery::{
        BrowseEvent, DiscoveryError, ErrorReporter, ResolvedService, ServiceBrowser,
    };
    use tokio::sync::mpsc;

    struct OneShotBrowser {
        service: Option<ResolvedService>,
        live: std::sync::Mutex<Vec<mpsc::Sender<BrowseEvent>>>,
    }

    impl ServiceBrowser for OneShotBrowser {
        fn browse(&self, _service_type: &str) -> Result<mpsc::Receiver<BrowseEvent>> {
            let (tx, rx) = mpsc::channel(4);
            if let Some(service) = self.service.clone() {
                tx.try_send(BrowseEvent::Resolved(service)).unwrap();
            }
            self.live.lock().unwrap().push(tx);
            Ok(rx)
        }

        fn stop_browse(&self, _service_type: &str) -> Result<()> {
            Ok(())
        }
    }

    struct Quiet;

    impl ErrorReporter for Quiet {
        fn report(&self, _error: &DiscoveryError) {}
    }

    fn endpoint(service: Option<ResolvedService>) -> DiscoveredEndpoint {
        let resolver = ServiceResolver::new(
            Arc::new(OneShotBrowser {
                service,
                live: Default::default(),
            }),
            Arc::new(Quiet),
            DiscoveryConfig::default(),
        );
        DiscoveredEndpoint::new(Arc::new(resolver), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_fixed_endpoint() {
        let url = Url::parse("ws://10.0.0.2:10001").unwrap();
        assert_eq!(FixedEndpoint(url.clone()).endpoint().await.unwrap(), url);
    }

    #[tokio::test]
    async fn test_discovered_endpoint_builds_websocket_url() {
        let config = DiscoveryConfig::default();
        let url = endpoint(Some(ResolvedService {
            instance: config.instance_name.clone(),
            addresses: vec![vec![192, 168, 1, 5]],
            port: 10001,
        }))
        .endpoint()
        .await
        .unwrap();
        assert_eq!(url.as_str(), "ws://192.168.1.5:10001/");
    }

    #[tokio::test]
    async fn test_discovered_endpoint_times_out() {
        let err = endpoint(None).endpoint().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}

//! Resolves the baby station's `{ip, port}` from the local service registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use babylink_common::{DiscoveryConfig, Error, Result, ServiceDescriptor};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace};

use crate::browser::{numeric_host, BrowseEvent, ResolvedService, ServiceBrowser};
use crate::error::{DiscoveryError, DiscoveryErrorKind, ErrorReporter};

#[derive(Default)]
struct BrowseState {
    enabled: bool,
    task: Option<JoinHandle<()>>,
}

/// Browses for the configured service and republishes the match.
///
/// At most one descriptor is current at any time. Disabling the resolver
/// stops browsing and clears the published value. Deadlines are the caller's
/// business: nothing in here times out except [`ServiceResolver::find`].
///
/// Browsing goes on after the first match instead of stopping there, so a
/// station that leaves the network clears the descriptor again.
pub struct ServiceResolver {
    browser: Arc<dyn ServiceBrowser>,
    reporter: Arc<dyn ErrorReporter>,
    config: Arc<DiscoveryConfig>,
    state: Mutex<BrowseState>,
    descriptor: Arc<watch::Sender<Option<ServiceDescriptor>>>,
    /// Bumped on every stop; browse tasks of an older generation never write.
    generation: Arc<AtomicU64>,
}

impl ServiceResolver {
    pub fn new(
        browser: Arc<dyn ServiceBrowser>,
        reporter: Arc<dyn ErrorReporter>,
        config: DiscoveryConfig,
    ) -> Self {
        let (descriptor, _) = watch::channel(None);
        Self {
            browser,
            reporter,
            config: Arc::new(config),
            state: Mutex::new(BrowseState::default()),
            descriptor: Arc::new(descriptor),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// The currently resolved service, if any.
    pub fn service(&self) -> watch::Receiver<Option<ServiceDescriptor>> {
        self.descriptor.subscribe()
    }

    pub fn current(&self) -> Option<ServiceDescriptor> {
        self.descriptor.borrow().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.lock_state().enabled
    }

    /// Starts or stops browsing. Repeating the current value does nothing.
    ///
    /// If the browser refuses to start, the failure is reported and the
    /// resolver stays disabled, so the next enable tries again.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.lock_state();
        if state.enabled == enabled {
            trace!(enabled, "discovery already in requested state");
            return;
        }
        if enabled {
            let started = self.start(&mut state);
            state.enabled = started;
        } else {
            state.enabled = false;
            self.stop(&mut state);
        }
    }

    /// Cancels an active search.
    pub fn stop_finding(&self) {
        self.set_enabled(false);
    }

    /// Enables discovery until a descriptor appears or `timeout` elapses.
    ///
    /// Discovery is disabled again before returning, whatever the outcome.
    pub async fn find(&self, timeout: Duration) -> Result<ServiceDescriptor> {
        let mut service = self.service();
        self.set_enabled(true);
        if !self.is_enabled() {
            return Err(Error::discovery("could not start browsing"));
        }

        let outcome = time::timeout(timeout, async {
            loop {
                let current = service.borrow_and_update().clone();
                if let Some(found) = current {
                    return Ok(found);
                }
                service
                    .changed()
                    .await
                    .map_err(|_| Error::closed("service resolver dropped"))?;
            }
        })
        .await;

        self.stop_finding();
        match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::timeout("could not find device")),
        }
    }

    fn start(&self, state: &mut BrowseState) -> bool {
        let events = match self.browser.browse(&self.config.service_type) {
            Ok(events) => events,
            Err(e) => {
                self.reporter.report(
                    &DiscoveryError::new(DiscoveryErrorKind::DidNotSearch)
                        .with("serviceType", &self.config.service_type)
                        .with("reason", e),
                );
                return false;
            }
        };
        debug!(service_type = %self.config.service_type, "browsing for station");
        let sink = DescriptorSink {
            descriptor: Arc::clone(&self.descriptor),
            generation: Arc::clone(&self.generation),
            mine: self.generation.load(Ordering::SeqCst),
        };
        state.task = Some(tokio::spawn(run_browse(
            events,
            Arc::clone(&self.config),
            Arc::clone(&self.reporter),
            sink,
        )));
        true
    }

    fn stop(&self, state: &mut BrowseState) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = state.task.take() {
            task.abort();
        }
        if let Err(e) = self.browser.stop_browse(&self.config.service_type) {
            debug!(error = %e, "stop browse failed");
        }
        self.descriptor.send_replace(None);
        debug!("discovery stopped");
    }

    fn lock_state(&self) -> MutexGuard<'_, BrowseState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ServiceResolver {
    fn drop(&mut self) {
        if let Some(task) = self.lock_state().task.take() {
            task.abort();
        }
    }
}

/// Where one browse task writes. Aborting a task does not wait for it, so
/// every write re-checks the generation under the watch lock.
struct DescriptorSink {
    descriptor: Arc<watch::Sender<Option<ServiceDescriptor>>>,
    generation: Arc<AtomicU64>,
    mine: u64,
}

impl DescriptorSink {
    fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.mine
    }

    fn publish(&self, found: ServiceDescriptor) {
        let changed = self.descriptor.send_if_modified(|current| {
            if !self.is_current() || current.as_ref() == Some(&found) {
                return false;
            }
            *current = Some(found.clone());
            true
        });
        if changed {
            info!(address = %found.address, port = %found.port, "station resolved");
        }
    }

    fn clear(&self) -> bool {
        self.descriptor
            .send_if_modified(|current| self.is_current() && current.take().is_some())
    }
}

async fn run_browse(
    mut events: mpsc::Receiver<BrowseEvent>,
    config: Arc<DiscoveryConfig>,
    reporter: Arc<dyn ErrorReporter>,
    sink: DescriptorSink,
) {
    let is_target = |instance: &str| instance == config.instance_name;

    while let Some(event) = events.recv().await {
        match event {
            BrowseEvent::Found { instance } if is_target(&instance) => {
                debug!(%instance, "station found, resolving");
            }
            BrowseEvent::Found { instance } => {
                trace!(%instance, "ignoring foreign service");
            }
            BrowseEvent::Resolved(service) if is_target(&service.instance) => {
                match describe(&service, &config) {
                    Ok(found) => sink.publish(found),
                    Err(err) => reporter.report(&err),
                }
            }
            BrowseEvent::Resolved(_) => {}
            BrowseEvent::ResolveFailed { instance, reason } if is_target(&instance) => {
                reporter.report(
                    &DiscoveryError::new(DiscoveryErrorKind::DidNotResolve)
                        .with("instance", instance)
                        .with("reason", reason),
                );
            }
            BrowseEvent::ResolveFailed { .. } => {}
            BrowseEvent::Removed { instance } if is_target(&instance) => {
                if sink.clear() {
                    info!(%instance, "station went away");
                }
            }
            BrowseEvent::Removed { .. } => {}
            BrowseEvent::SearchFailed { reason } => {
                reporter.report(
                    &DiscoveryError::new(DiscoveryErrorKind::DidNotSearch).with("reason", reason),
                );
            }
            BrowseEvent::DomainRemoved { domain } => {
                reporter.report(
                    &DiscoveryError::new(DiscoveryErrorKind::DidRemoveDomain).with("name", domain),
                );
            }
        }
    }
    debug!("browse event stream ended");
}

fn describe(
    service: &ResolvedService,
    config: &DiscoveryConfig,
) -> std::result::Result<ServiceDescriptor, DiscoveryError> {
    let first = service.addresses.first();
    let contains_port = config.allows_port(service.port);
    let host = first.and_then(|octets| numeric_host(octets));

    match host {
        Some(ip) if contains_port => Ok(ServiceDescriptor::new(ip, service.port.to_string())),
        _ => Err(DiscoveryError::new(DiscoveryErrorKind::IpNotParsed)
            .with(
                "address",
                first
                    .map(|octets| format!("{octets:?}"))
                    .unwrap_or_else(|| "null".to_string()),
            )
            .with("containsPort", contains_port)),
    }
}

//! Rebuilds the parent's session after socket loss and maps host lifecycle
//! transitions onto negotiation pause/resume.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use babylink_common::{ConnectionState, Error, Result, SessionConfig};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::endpoint::EndpointProvider;
use crate::negotiator::{ClientNegotiator, NegotiationState, PeerConnectionFactory};
use crate::parent::ParentSession;
use crate::slot::ResettableSlot;
use crate::socket::SocketConnector;

/// Pushed by the host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    WillResignActive,
    WillEnterForeground,
}

/// Owns the parent's per-session services.
///
/// The session (socket, conductor, negotiator) is built on first access. When
/// its socket disconnects the whole session is dropped at once and the next
/// [`session`](Self::session) call resolves the endpoint again and builds a
/// fresh one. There is no frame-level retry anywhere below this.
pub struct LifecycleCoordinator {
    endpoint: Arc<dyn EndpointProvider>,
    connector: Arc<dyn SocketConnector>,
    peers: Arc<dyn PeerConnectionFactory>,
    config: SessionConfig,
    session: ResettableSlot<ParentSession>,
    state: watch::Sender<ConnectionState>,
    shut_down: AtomicBool,
}

impl LifecycleCoordinator {
    pub fn new(
        endpoint: Arc<dyn EndpointProvider>,
        connector: Arc<dyn SocketConnector>,
        peers: Arc<dyn PeerConnectionFactory>,
        config: SessionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            connector,
            peers,
            config,
            session: ResettableSlot::new(),
            state: watch::channel(ConnectionState::Idle).0,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The active session, building one if there is none.
    pub async fn session(self: &Arc<Self>) -> Result<Arc<ParentSession>> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::closed("lifecycle coordinator shut down"));
        }
        let this = Arc::clone(self);
        self.session
            .get_or_try_init(move || async move {
                let built = this.build_session().await;
                if built.is_err() {
                    this.set_state(ConnectionState::Idle);
                }
                built
            })
            .await
    }

    pub async fn current_session(&self) -> Option<Arc<ParentSession>> {
        self.session.current().await
    }

    /// Drops the current session; the next access rebuilds it.
    pub async fn reset(&self) {
        if let Some(session) = self.session.take().await {
            session.close().await;
            info!(socket = session.id(), "session reset");
        }
        self.set_state(ConnectionState::Idle);
    }

    pub async fn handle(&self, event: LifecycleEvent) {
        let Some(session) = self.session.current().await else {
            debug!(?event, "no active session, ignoring lifecycle event");
            return;
        };
        match event {
            LifecycleEvent::WillResignActive => session.negotiator().pause().await,
            LifecycleEvent::WillEnterForeground => {
                if let Err(e) = session.negotiator().resume().await {
                    warn!(error = %e, "failed to resume negotiation");
                }
            }
        }
    }

    /// Feeds host lifecycle events into [`handle`](Self::handle) until the
    /// sender goes away.
    pub fn spawn_lifecycle_listener(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<LifecycleEvent>,
    ) -> JoinHandle<()> {
        let coordinator = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(coordinator) = coordinator.upgrade() else {
                    return;
                };
                coordinator.handle(event).await;
            }
        })
    }

    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.reset().await;
        self.set_state(ConnectionState::Closed);
    }

    async fn build_session(self: &Arc<Self>) -> Result<ParentSession> {
        self.set_state(ConnectionState::Discovering);
        let url = self.endpoint.endpoint().await?;
        self.set_state(ConnectionState::Resolved);

        self.set_state(ConnectionState::Connecting);
        let socket = self.connector.connect(&url).await?;

        let negotiator = Arc::new(ClientNegotiator::new(Arc::clone(&self.peers)));
        let session = ParentSession::new(socket, negotiator, self.config.channel_capacity);
        self.set_state(ConnectionState::Negotiating);
        session.start().await?;

        tokio::spawn(watch_session(
            Arc::downgrade(self),
            session.id(),
            session.disconnected(),
            session.negotiator().state(),
        ));
        info!(%url, socket = session.id(), "session established");
        Ok(session)
    }

    async fn handle_disconnect(&self, id: u64) {
        let Some(session) = self.session.take_if(|session| session.id() == id).await else {
            return;
        };
        warn!(socket = id, "signaling socket lost, dropping session");
        session.close().await;
        if !self.shut_down.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::Idle);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = ?*current, to = ?state, "connection state");
            *current = state;
            true
        });
    }
}

async fn watch_session(
    coordinator: Weak<LifecycleCoordinator>,
    id: u64,
    mut disconnected: watch::Receiver<bool>,
    mut negotiation: watch::Receiver<NegotiationState>,
) {
    loop {
        tokio::select! {
            _ = async { let _ = disconnected.wait_for(|closed| *closed).await; } => break,
            changed = negotiation.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *negotiation.borrow_and_update();
                let Some(coordinator) = coordinator.upgrade() else {
                    return;
                };
                if let Some(state) = connection_state(state) {
                    coordinator.set_state(state);
                }
            }
        }
    }
    if let Some(coordinator) = coordinator.upgrade() {
        coordinator.handle_disconnect(id).await;
    }
}

fn connection_state(state: NegotiationState) -> Option<ConnectionState> {
    match state {
        NegotiationState::Idle => None,
        NegotiationState::Offering
        | NegotiationState::AwaitingAnswer
        | NegotiationState::Answering => Some(ConnectionState::Negotiating),
        NegotiationState::Connected => Some(ConnectionState::Streaming),
        NegotiationState::Paused => Some(ConnectionState::Paused),
    }
}

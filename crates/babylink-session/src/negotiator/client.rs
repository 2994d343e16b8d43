use std::collections::VecDeque;
use std::sync::Arc;

use babylink_common::{Error, IceCandidate, Result, SessionDescription};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    spawn_event_pump, LocalSignal, MediaConstraints, MediaStream, NegotiationState,
    PeerConnection, PeerConnectionFactory, PeerStreams, MAX_PENDING_CANDIDATES,
};

const STREAM_CAPACITY: usize = 64;

#[derive(Default)]
struct ClientInner {
    started: bool,
    connection: Option<Box<dyn PeerConnection>>,
    pump: Option<JoinHandle<()>>,
    answered: bool,
    pending: VecDeque<IceCandidate>,
}

impl ClientInner {
    async fn close_connection(&mut self) -> bool {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.answered = false;
        self.pending.clear();
        let Some(connection) = self.connection.take() else {
            return false;
        };
        if let Err(e) = connection.close().await {
            warn!(error = %e, "closing peer connection failed");
        }
        true
    }
}

/// Parent-side negotiator: creates the offer and applies the station's answer.
///
/// Holds at most one peer connection. `pause` closes it but remembers that a
/// session was started; `resume` then issues a brand-new offer. Station
/// candidates that overtake the answer are queued until it has been applied.
pub struct ClientNegotiator {
    factory: Arc<dyn PeerConnectionFactory>,
    constraints: MediaConstraints,
    inner: Mutex<ClientInner>,
    streams: Arc<PeerStreams>,
}

impl ClientNegotiator {
    pub fn new(factory: Arc<dyn PeerConnectionFactory>) -> Self {
        Self {
            factory,
            constraints: MediaConstraints::stream(),
            inner: Mutex::new(ClientInner::default()),
            streams: PeerStreams::new(STREAM_CAPACITY),
        }
    }

    /// Local offers, one per created connection.
    pub fn sdp_offers(&self) -> broadcast::Receiver<SessionDescription> {
        self.streams.descriptions.subscribe()
    }

    /// Local ICE candidates as the engine discovers them.
    pub fn ice_candidates(&self) -> broadcast::Receiver<IceCandidate> {
        self.streams.candidates.subscribe()
    }

    /// Offers and local candidates in send order.
    pub fn signals(&self) -> broadcast::Receiver<LocalSignal> {
        self.streams.signals.subscribe()
    }

    /// The most recent remote media stream.
    pub fn media_stream(&self) -> watch::Receiver<Option<MediaStream>> {
        self.streams.remote_stream.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<NegotiationState> {
        self.streams.state.subscribe()
    }

    pub async fn is_started(&self) -> bool {
        self.inner.lock().await.started
    }

    /// Starts negotiation unless already started.
    ///
    /// A failed offer leaves the negotiator stopped so the call can be retried.
    pub async fn start_if_needed(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.started {
            return Ok(());
        }
        inner.started = true;
        if let Err(e) = self.create_offer(&mut inner).await {
            inner.close_connection().await;
            inner.started = false;
            self.streams.retire_connection();
            self.streams.set_state(NegotiationState::Idle);
            return Err(e);
        }
        Ok(())
    }

    /// Applies the station's answer, then any candidates that arrived before
    /// it. Without a connection this does nothing.
    pub async fn set_answer_sdp(&self, sdp: SessionDescription) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;
        let Some(connection) = inner.connection.as_ref() else {
            debug!("answer arrived without a peer connection, ignoring");
            return Ok(());
        };
        connection.set_remote_description(sdp).await?;
        inner.answered = true;
        for candidate in inner.pending.drain(..) {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!(error = %e, "queued ICE candidate rejected");
            }
        }
        self.streams.set_state(NegotiationState::Connected);
        info!("remote answer applied");
        Ok(())
    }

    /// Adds a remote candidate, or queues it until the answer is applied.
    /// Without a connection this does nothing.
    pub async fn set_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(connection) = inner.connection.as_ref() else {
            debug!("candidate arrived without a peer connection, ignoring");
            return Ok(());
        };
        if inner.answered {
            return connection.add_ice_candidate(candidate).await;
        }

        inner.pending.push_back(candidate);
        if inner.pending.len() > MAX_PENDING_CANDIDATES {
            inner.pending.pop_front();
            return Err(Error::protocol(
                "too many ICE candidates before the answer; dropped the oldest",
            ));
        }
        debug!(pending = inner.pending.len(), "queued ICE candidate until answer");
        Ok(())
    }

    pub async fn pending_candidates(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    /// Closes the connection and forgets that negotiation was started.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        inner.close_connection().await;
        inner.started = false;
        self.streams.retire_connection();
        self.streams.set_state(NegotiationState::Idle);
    }

    /// Closes the connection but keeps the started flag. No-op if never started.
    pub async fn pause(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.started {
            return;
        }
        if inner.close_connection().await {
            info!("negotiation paused");
        }
        self.streams.retire_connection();
        self.streams.set_state(NegotiationState::Paused);
    }

    /// Issues a fresh offer after [`pause`](Self::pause). No-op otherwise.
    pub async fn resume(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.started || *self.streams.state.borrow() != NegotiationState::Paused {
            return Ok(());
        }
        info!("negotiation resuming with a new offer");
        if let Err(e) = self.create_offer(&mut inner).await {
            inner.close_connection().await;
            self.streams.retire_connection();
            self.streams.set_state(NegotiationState::Paused);
            return Err(e);
        }
        Ok(())
    }

    async fn create_offer(&self, inner: &mut ClientInner) -> Result<()> {
        self.streams.set_state(NegotiationState::Offering);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = self.factory.peer_connection(events_tx).await?;
        let generation = self.streams.begin_connection();
        inner.pump = Some(spawn_event_pump(
            events_rx,
            Arc::clone(&self.streams),
            generation,
        ));
        let connection = inner.connection.insert(connection);

        let offer = connection.create_offer(&self.constraints).await?;
        connection.set_local_description(offer.clone()).await?;

        self.streams.publish_description(offer);
        self.streams.set_state(NegotiationState::AwaitingAnswer);
        debug!("local offer published");
        Ok(())
    }
}

impl Drop for ClientNegotiator {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.try_lock() {
            if let Some(pump) = inner.pump.take() {
                pump.abort();
            }
        }
    }
}

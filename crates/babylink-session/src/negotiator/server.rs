use std::collections::VecDeque;
use std::sync::Arc;

use babylink_common::{Error, IceCandidate, Result, SdpType, SessionDescription};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    spawn_event_pump, LocalSignal, MediaConstraints, MediaStream, NegotiationState,
    PeerConnection, PeerConnectionFactory, PeerStreams, MAX_PENDING_CANDIDATES,
};

const STREAM_CAPACITY: usize = 64;

#[derive(Default)]
struct ServerInner {
    connection: Option<Box<dyn PeerConnection>>,
    pump: Option<JoinHandle<()>>,
    pending: VecDeque<IceCandidate>,
}

impl ServerInner {
    async fn close_connection(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                warn!(error = %e, "closing peer connection failed");
            }
        }
    }
}

/// Station-side negotiator: answers offers, never initiates one.
///
/// Remote candidates that arrive before an offer has been applied are queued
/// and added right after the answer is set.
pub struct ServerNegotiator {
    factory: Arc<dyn PeerConnectionFactory>,
    constraints: MediaConstraints,
    inner: Mutex<ServerInner>,
    streams: Arc<PeerStreams>,
}

impl ServerNegotiator {
    pub fn new(factory: Arc<dyn PeerConnectionFactory>) -> Self {
        Self {
            factory,
            constraints: MediaConstraints::answer(),
            inner: Mutex::new(ServerInner::default()),
            streams: PeerStreams::new(STREAM_CAPACITY),
        }
    }

    pub fn sdp_answers(&self) -> broadcast::Receiver<SessionDescription> {
        self.streams.descriptions.subscribe()
    }

    pub fn ice_candidates(&self) -> broadcast::Receiver<IceCandidate> {
        self.streams.candidates.subscribe()
    }

    /// Answers and local candidates in send order: no candidate of a
    /// connection comes before its answer.
    pub fn signals(&self) -> broadcast::Receiver<LocalSignal> {
        self.streams.signals.subscribe()
    }

    /// The station's own outgoing stream, once the capture pipeline attached it.
    pub fn local_stream(&self) -> watch::Receiver<Option<MediaStream>> {
        self.streams.local_stream.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<NegotiationState> {
        self.streams.state.subscribe()
    }

    pub async fn pending_candidates(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    /// Answers `offer` on a fresh connection, replacing any previous one.
    ///
    /// On failure the half-built connection is discarded and the negotiator
    /// is ready for the next offer.
    pub async fn handle_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        if offer.sdp_type != SdpType::Offer {
            return Err(Error::protocol(format!(
                "expected an offer, got {:?}",
                offer.sdp_type
            )));
        }

        let mut inner = self.inner.lock().await;
        inner.close_connection().await;
        self.streams.set_state(NegotiationState::Answering);

        match self.answer(&mut inner, offer).await {
            Ok(answer) => {
                self.streams.publish_description(answer.clone());
                self.streams.set_state(NegotiationState::Connected);
                info!("answer published");
                Ok(answer)
            }
            Err(e) => {
                inner.close_connection().await;
                inner.pending.clear();
                self.streams.retire_connection();
                self.streams.set_state(NegotiationState::Idle);
                Err(e)
            }
        }
    }

    /// Applies a remote candidate, or queues it until an offer has been answered.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(connection) = inner.connection.as_ref() {
            return connection.add_ice_candidate(candidate).await;
        }

        inner.pending.push_back(candidate);
        if inner.pending.len() > MAX_PENDING_CANDIDATES {
            inner.pending.pop_front();
            return Err(Error::protocol(
                "too many ICE candidates before an offer; dropped the oldest",
            ));
        }
        debug!(pending = inner.pending.len(), "queued early ICE candidate");
        Ok(())
    }

    /// Closes the connection and forgets queued candidates.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        inner.close_connection().await;
        inner.pending.clear();
        self.streams.retire_connection();
        self.streams.set_state(NegotiationState::Idle);
    }

    /// Runs the answer steps on a connection kept in `inner`, so the caller
    /// can close it whichever step fails.
    async fn answer(
        &self,
        inner: &mut ServerInner,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = self.factory.peer_connection(events_tx).await?;
        let generation = self.streams.begin_connection();
        inner.pump = Some(spawn_event_pump(
            events_rx,
            Arc::clone(&self.streams),
            generation,
        ));
        let connection = inner.connection.insert(connection);

        connection.set_remote_description(offer).await?;
        let answer = connection.create_answer(&self.constraints).await?;
        connection.set_local_description(answer.clone()).await?;

        for candidate in inner.pending.drain(..) {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!(error = %e, "queued ICE candidate rejected");
            }
        }
        Ok(answer)
    }
}

impl Drop for ServerNegotiator {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.try_lock() {
            if let Some(pump) = inner.pump.take() {
                pump.abort();
            }
        }
    }
}

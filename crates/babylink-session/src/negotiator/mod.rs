//! Peer-connection signaling state machines.
//!
//! The media engine sits behind [`PeerConnectionFactory`] and
//! [`PeerConnection`]. Engine callbacks (new ICE candidates, remote and local
//! streams) arrive as [`PeerEvent`]s on a channel handed to the factory, and
//! the negotiators republish them as broadcast/watch streams.

mod client;
mod rtc;
mod server;

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use babylink_common::{IceCandidate, Result, SessionDescription};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

pub use client::ClientNegotiator;
pub use rtc::RtcPeerFactory;
pub use server::ServerNegotiator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

/// A media track that became available on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub stream_id: String,
    pub track_id: String,
    pub kind: MediaKind,
}

/// Constraints applied when creating an offer or answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub receive_audio: bool,
    pub receive_video: bool,
    pub dtls_srtp_key_agreement: bool,
}

impl MediaConstraints {
    /// Receive audio and video, DTLS-SRTP key agreement on.
    pub fn stream() -> Self {
        Self {
            receive_audio: true,
            receive_video: true,
            dtls_srtp_key_agreement: true,
        }
    }

    /// No receive requirements; the answerer mirrors what the offer asks for.
    pub fn answer() -> Self {
        Self {
            receive_audio: false,
            receive_video: false,
            dtls_srtp_key_agreement: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    RemoteStreamAdded(MediaStream),
    LocalStreamAdded(MediaStream),
    IceCandidate(IceCandidate),
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// What a negotiator sends to the remote side, in the order it must go out.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalSignal {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

/// Remote candidates the engine cannot take until a remote description is set.
pub(crate) const MAX_PENDING_CANDIDATES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NegotiationState {
    #[default]
    Idle,
    Offering,
    AwaitingAnswer,
    Answering,
    Connected,
    Paused,
}

/// One native peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, constraints: &MediaConstraints) -> Result<SessionDescription>;
    async fn create_answer(&self, constraints: &MediaConstraints) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Creates peer connections that report their callbacks on `events`.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn peer_connection(&self, events: PeerEventSender) -> Result<Box<dyn PeerConnection>>;
}

/// Holds local candidates back until the description they belong to is out.
#[derive(Default)]
struct CandidateGate {
    generation: u64,
    described: bool,
    held: Vec<IceCandidate>,
}

/// Streams shared by a negotiator and its event pump.
pub(crate) struct PeerStreams {
    /// Local offers (client) or answers (server).
    pub descriptions: broadcast::Sender<SessionDescription>,
    pub candidates: broadcast::Sender<IceCandidate>,
    /// Descriptions and candidates together, description first.
    pub signals: broadcast::Sender<LocalSignal>,
    pub remote_stream: watch::Sender<Option<MediaStream>>,
    pub local_stream: watch::Sender<Option<MediaStream>>,
    pub state: watch::Sender<NegotiationState>,
    gate: Mutex<CandidateGate>,
}

impl PeerStreams {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            descriptions: broadcast::channel(capacity).0,
            candidates: broadcast::channel(capacity).0,
            signals: broadcast::channel(capacity).0,
            remote_stream: watch::channel(None).0,
            local_stream: watch::channel(None).0,
            state: watch::channel(NegotiationState::Idle).0,
            gate: Mutex::new(CandidateGate::default()),
        })
    }

    pub fn set_state(&self, state: NegotiationState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = ?*current, to = ?state, "negotiation state");
            *current = state;
            true
        });
    }

    fn gate(&self) -> MutexGuard<'_, CandidateGate> {
        match self.gate.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Starts a new connection. Candidates of older connections are dropped
    /// from here on, and new ones wait for [`publish_description`](Self::publish_description).
    pub fn begin_connection(&self) -> u64 {
        let mut gate = self.gate();
        gate.generation += 1;
        gate.described = false;
        gate.held.clear();
        gate.generation
    }

    /// Drops whatever the current connection still has in flight.
    pub fn retire_connection(&self) {
        self.begin_connection();
    }

    /// Publishes the local description, then every candidate held for it.
    pub fn publish_description(&self, description: SessionDescription) {
        let mut gate = self.gate();
        let _ = self.descriptions.send(description.clone());
        let _ = self.signals.send(LocalSignal::Description(description));
        gate.described = true;
        let held = std::mem::take(&mut gate.held);
        if !held.is_empty() {
            debug!(count = held.len(), "releasing held local candidates");
        }
        for candidate in held {
            self.send_candidate(candidate);
        }
    }

    fn publish_candidate(&self, generation: u64, candidate: IceCandidate) {
        let mut gate = self.gate();
        if gate.generation != generation {
            debug!("candidate from a replaced connection, dropping");
        } else if gate.described {
            self.send_candidate(candidate);
        } else {
            gate.held.push(candidate);
        }
    }

    fn send_candidate(&self, candidate: IceCandidate) {
        let _ = self.candidates.send(candidate.clone());
        let _ = self.signals.send(LocalSignal::Candidate(candidate));
    }
}

/// Republishes engine callbacks of one connection.
///
/// Call [`PeerStreams::begin_connection`] first and pass its generation.
pub(crate) fn spawn_event_pump(
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    streams: Arc<PeerStreams>,
    generation: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                PeerEvent::IceCandidate(candidate) => {
                    streams.publish_candidate(generation, candidate);
                }
                PeerEvent::RemoteStreamAdded(stream) => {
                    streams.remote_stream.send_replace(Some(stream));
                }
                PeerEvent::LocalStreamAdded(stream) => {
                    streams.local_stream.send_replace(Some(stream));
                }
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod fake {
    //! Counting in-memory media engine.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct EngineLog {
        pub created: AtomicUsize,
        pub offers: AtomicUsize,
        pub answers: AtomicUsize,
        pub closed: AtomicUsize,
        pub local: Mutex<Vec<SessionDescription>>,
        pub remote: Mutex<Vec<SessionDescription>>,
        pub candidates: Mutex<Vec<IceCandidate>>,
        pub senders: Mutex<Vec<PeerEventSender>>,
        pub fail_remote: std::sync::atomic::AtomicBool,
        /// Emitted by `set_local_description`, the way real engines start
        /// gathering as soon as the local description is set.
        pub gathered_on_describe: Mutex<Option<IceCandidate>>,
    }

    impl EngineLog {
        pub fn count(counter: &AtomicUsize) -> usize {
            counter.load(Ordering::SeqCst)
        }

        /// Emits an engine callback on the most recent connection.
        pub fn emit(&self, event: PeerEvent) {
            let senders = self.senders.lock().unwrap();
            senders
                .last()
                .expect("no connection created")
                .send(event)
                .unwrap();
        }
    }

    #[derive(Clone, Default)]
    pub struct FakeEngine {
        pub log: Arc<EngineLog>,
    }

    struct FakeConnection {
        id: usize,
        log: Arc<EngineLog>,
        events: PeerEventSender,
    }

    #[async_trait]
    impl PeerConnectionFactory for FakeEngine {
        async fn peer_connection(
            &self,
            events: PeerEventSender,
        ) -> Result<Box<dyn PeerConnection>> {
            let id = self.log.created.fetch_add(1, Ordering::SeqCst) + 1;
            self.log.senders.lock().unwrap().push(events.clone());
            Ok(Box::new(FakeConnection {
                id,
                log: Arc::clone(&self.log),
                events,
            }))
        }
    }

    #[async_trait]
    impl PeerConnection for FakeConnection {
        async fn create_offer(&self, _: &MediaConstraints) -> Result<SessionDescription> {
            self.log.offers.fetch_add(1, Ordering::SeqCst);
            Ok(SessionDescription::offer(format!("offer-{}", self.id)))
        }

        async fn create_answer(&self, _: &MediaConstraints) -> Result<SessionDescription> {
            self.log.answers.fetch_add(1, Ordering::SeqCst);
            Ok(SessionDescription::answer(format!("answer-{}", self.id)))
        }

        async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
            self.log.local.lock().unwrap().push(description);
            let gathered = self.log.gathered_on_describe.lock().unwrap().clone();
            if let Some(candidate) = gathered {
                let _ = self.events.send(PeerEvent::IceCandidate(candidate));
                tokio::task::yield_now().await;
            }
            Ok(())
        }

        async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
            if self.log.fail_remote.load(Ordering::SeqCst) {
                return Err(babylink_common::Error::negotiation("malformed sdp"));
            }
            self.log.remote.lock().unwrap().push(description);
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            self.log.candidates.lock().unwrap().push(candidate);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.log.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

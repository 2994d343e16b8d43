//! The parent (viewer) side of one signaling session.

use std::sync::Arc;

use babylink_common::{Error, EventMessage, Message, Result};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::DecoderRegistry;
use crate::conductor::Conductor;
use crate::negotiator::{ClientNegotiator, LocalSignal, MediaStream};
use crate::socket::Socket;

/// One conductor paired with one client negotiator.
///
/// Local offers and candidates are written to the socket, offer first; the station's
/// answer and candidates are applied to the negotiator; event messages are
/// republished on [`events`](Self::events). Dropping the session stops the
/// pumps but leaves the negotiator to its owner.
pub struct ParentSession {
    conductor: Conductor<Message>,
    negotiator: Arc<ClientNegotiator>,
    emitter: mpsc::Sender<Message>,
    events: broadcast::Sender<EventMessage>,
    tasks: Vec<JoinHandle<()>>,
}

impl ParentSession {
    pub fn new(socket: Socket, negotiator: Arc<ClientNegotiator>, capacity: usize) -> Self {
        let (emitter, emit_rx) = mpsc::channel(capacity);
        let (handle_tx, handle_rx) = mpsc::channel(capacity);
        let (events, _) = broadcast::channel(capacity);

        let signals = negotiator.signals();
        let conductor = Conductor::new(socket, emit_rx, handle_tx, DecoderRegistry::all());

        let tasks = vec![
            tokio::spawn(forward(signals, emitter.clone(), offer_frame)),
            tokio::spawn(route_inbound(
                handle_rx,
                Arc::clone(&negotiator),
                events.clone(),
            )),
        ];

        Self {
            conductor,
            negotiator,
            emitter,
            events,
            tasks,
        }
    }

    pub fn id(&self) -> u64 {
        self.conductor.id()
    }

    /// Sends the first offer unless negotiation already started.
    pub async fn start(&self) -> Result<()> {
        self.negotiator.start_if_needed().await
    }

    pub fn negotiator(&self) -> &Arc<ClientNegotiator> {
        &self.negotiator
    }

    /// Event messages received from the station.
    pub fn events(&self) -> broadcast::Receiver<EventMessage> {
        self.events.subscribe()
    }

    pub async fn send_event(&self, event: EventMessage) -> Result<()> {
        self.emitter
            .send(Message::Event(event))
            .await
            .map_err(|_| Error::closed("session conductor stopped"))
    }

    pub fn media_stream(&self) -> watch::Receiver<Option<MediaStream>> {
        self.negotiator.media_stream()
    }

    pub fn disconnected(&self) -> watch::Receiver<bool> {
        self.conductor.disconnected()
    }

    pub fn is_closed(&self) -> bool {
        self.conductor.is_closed()
    }

    /// Closes the peer connection. The socket goes when the session is dropped.
    pub async fn close(&self) {
        self.negotiator.stop().await;
    }
}

impl Drop for ParentSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Copies a negotiator stream onto the conductor's outbound channel.
pub(crate) async fn forward<T: Clone>(
    mut source: broadcast::Receiver<T>,
    sink: mpsc::Sender<Message>,
    wrap: fn(T) -> Message,
) {
    loop {
        match source.recv().await {
            Ok(item) => {
                if sink.send(wrap(item)).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "outbound signaling stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn offer_frame(signal: LocalSignal) -> Message {
    match signal {
        LocalSignal::Description(offer) => Message::SdpOffer(offer),
        LocalSignal::Candidate(candidate) => Message::IceCandidate(candidate),
    }
}

async fn route_inbound(
    mut inbound: mpsc::Receiver<Message>,
    negotiator: Arc<ClientNegotiator>,
    events: broadcast::Sender<EventMessage>,
) {
    while let Some(message) = inbound.recv().await {
        match message {
            Message::SdpAnswer(answer) => {
                if let Err(e) = negotiator.set_answer_sdp(answer).await {
                    warn!(error = %e, "failed to apply station answer");
                }
            }
            Message::IceCandidate(candidate) => {
                if let Err(e) = negotiator.set_ice_candidate(candidate).await {
                    warn!(error = %e, "failed to add station ICE candidate");
                }
            }
            Message::Event(event) => {
                debug!(action = ?event.action, "event from station");
                let _ = events.send(event);
            }
            Message::SdpOffer(_) => {
                warn!("unexpected offer from station, ignoring");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiator::fake::{EngineLog, FakeEngine};
    use babylink_common::{EventKind, IceCandidate, SessionDescription};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn session() -> (ParentSession, crate::socket::SocketPeer, Arc<EngineLog>) {
        let engine = FakeEngine::default();
        let log = Arc::clone(&engine.log);
        let negotiator = Arc::new(ClientNegotiator::new(Arc::new(engine)));
        let (socket, peer) = Socket::pair(16);
        (ParentSession::new(socket, negotiator, 16), peer, log)
    }

    async fn until(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(1), async {
            while !check() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never held");
    }

    #[tokio::test]
    async fn test_start_writes_offer_frame() {
        let (session, mut peer, _log) = session();
        session.start().await.unwrap();

        let frame = timeout(Duration::from_secs(1), peer.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            frame,
            Message::SdpOffer(SessionDescription::offer("offer-1"))
                .to_text()
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_answer_and_candidates_reach_negotiator() {
        let (session, peer, log) = session();
        session.start().await.unwrap();

        peer.send(Message::SdpAnswer(SessionDescription::answer("answer")).to_text().unwrap())
            .await
            .unwrap();
        let candidate = IceCandidate {
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            candidate: "candidate:station".into(),
        };
        peer.send(Message::IceCandidate(candidate.clone()).to_text().unwrap())
            .await
            .unwrap();

        until(|| log.candidates.lock().unwrap().len() == 1).await;
        assert_eq!(
            log.remote.lock().unwrap().as_slice(),
            &[SessionDescription::answer("answer")]
        );
        assert_eq!(log.candidates.lock().unwrap()[0], candidate);
    }

    #[tokio::test]
    async fn test_local_candidates_are_written() {
        let (session, mut peer, log) = session();
        session.start().await.unwrap();
        peer.recv().await.unwrap();

        let candidate = IceCandidate {
            sdp_mid: Some("1".into()),
            sdp_mline_index: Some(1),
            candidate: "candidate:parent".into(),
        };
        log.emit(crate::negotiator::PeerEvent::IceCandidate(candidate.clone()));

        let frame = timeout(Duration::from_secs(1), peer.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, Message::IceCandidate(candidate).to_text().unwrap());
    }

    #[tokio::test]
    async fn test_events_flow_both_ways() {
        let (session, mut peer, _log) = session();
        let mut events = session.events();

        let crying = EventMessage::now(EventKind::BabyIsCrying);
        peer.send(Message::Event(crying.clone()).to_text().unwrap())
            .await
            .unwrap();
        assert_eq!(
            timeout(Duration::from_secs(1), events.recv())
                .await
                .unwrap()
                .unwrap(),
            crying
        );

        let reset = EventMessage::now(EventKind::Reset);
        session.send_event(reset.clone()).await.unwrap();
        assert_eq!(
            peer.recv().await.unwrap(),
            Message::Event(reset).to_text().unwrap()
        );
    }

    #[tokio::test]
    async fn test_close_stops_negotiation() {
        let (session, _peer, log) = session();
        session.start().await.unwrap();
        session.close().await;
        assert_eq!(EngineLog::count(&log.closed), 1);
        assert!(!session.negotiator().is_started().await);
    }
}

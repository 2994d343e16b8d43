//! The baby (sensor) side: answers one parent at a time.

use std::sync::Arc;

use babylink_common::{EventMessage, Message, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

use crate::codec::DecoderRegistry;
use crate::conductor::Conductor;
use crate::negotiator::{LocalSignal, PeerConnectionFactory, ServerNegotiator};
use crate::parent::forward;
use crate::socket::Socket;

pub struct BabyStation {
    negotiator: Arc<ServerNegotiator>,
    capacity: usize,
    outbound: broadcast::Sender<EventMessage>,
    received: broadcast::Sender<EventMessage>,
}

impl BabyStation {
    pub fn new(peers: Arc<dyn PeerConnectionFactory>, capacity: usize) -> Self {
        Self {
            negotiator: Arc::new(ServerNegotiator::new(peers)),
            capacity,
            outbound: broadcast::channel(capacity).0,
            received: broadcast::channel(capacity).0,
        }
    }

    pub fn negotiator(&self) -> &Arc<ServerNegotiator> {
        &self.negotiator
    }

    /// Queues an event for the connected parent. Returns false when nobody
    /// is connected, in which case the event is dropped.
    pub fn notify(&self, event: EventMessage) -> bool {
        match self.outbound.send(event) {
            Ok(_) => true,
            Err(_) => {
                debug!("no parent connected, event dropped");
                false
            }
        }
    }

    /// Events sent by parents.
    pub fn received_events(&self) -> broadcast::Receiver<EventMessage> {
        self.received.subscribe()
    }

    /// Accepts WebSocket parents until the listener fails.
    ///
    /// Parents are served sequentially; a second parent waits in the accept
    /// backlog until the first one disconnects.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "baby station listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let ws = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(%peer, error = %e, "websocket handshake failed");
                    continue;
                }
            };
            info!(%peer, "parent connected");
            self.serve_parent(Socket::from_websocket(ws, self.capacity))
                .await;
            info!(%peer, "parent disconnected");
        }
    }

    /// Runs one signaling session until its socket closes, then stops the
    /// peer connection so the next parent starts clean.
    pub async fn serve_parent(&self, socket: Socket) {
        let (emitter, emit_rx) = mpsc::channel(self.capacity);
        let (handle_tx, mut inbound) = mpsc::channel(self.capacity);

        let tasks = [
            tokio::spawn(forward(
                self.negotiator.signals(),
                emitter.clone(),
                answer_frame,
            )),
            tokio::spawn(forward(self.outbound.subscribe(), emitter, Message::Event)),
        ];
        let conductor = Conductor::new(socket, emit_rx, handle_tx, DecoderRegistry::all());
        let mut disconnected = conductor.disconnected();

        loop {
            let message = tokio::select! {
                message = inbound.recv() => message,
                _ = closed(&mut disconnected) => None,
            };
            match message {
                Some(message) => self.handle(message).await,
                None => break,
            }
        }

        for task in tasks {
            task.abort();
        }
        drop(conductor);
        self.negotiator.stop().await;
    }

    async fn handle(&self, message: Message) {
        match message {
            Message::SdpOffer(offer) => {
                if let Err(e) = self.negotiator.handle_offer(offer).await {
                    error!(error = %e, "negotiation with parent failed");
                }
            }
            Message::IceCandidate(candidate) => {
                if let Err(e) = self.negotiator.add_ice_candidate(candidate).await {
                    warn!(error = %e, "ICE candidate out of order");
                }
            }
            Message::Event(event) => {
                debug!(action = ?event.action, "event from parent");
                let _ = self.received.send(event);
            }
            Message::SdpAnswer(_) => {
                warn!("unexpected answer from parent, ignoring");
            }
        }
    }
}

fn answer_frame(signal: LocalSignal) -> Message {
    match signal {
        LocalSignal::Description(answer) => Message::SdpAnswer(answer),
        LocalSignal::Candidate(candidate) => Message::IceCandidate(candidate),
    }
}

async fn closed(disconnected: &mut watch::Receiver<bool>) {
    let _ = disconnected.wait_for(|closed| *closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiator::fake::{EngineLog, FakeEngine};
    use crate::negotiator::PeerEvent;
    use crate::socket::SocketPeer;
    use babylink_common::{EventKind, IceCandidate, SessionDescription};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    fn station() -> (Arc<BabyStation>, Arc<EngineLog>) {
        let engine = FakeEngine::default();
        let log = Arc::clone(&engine.log);
        (Arc::new(BabyStation::new(Arc::new(engine), 16)), log)
    }

    fn connect(station: &Arc<BabyStation>) -> (SocketPeer, JoinHandle<()>) {
        let (socket, peer) = Socket::pair(16);
        let station = Arc::clone(station);
        let task = tokio::spawn(async move { station.serve_parent(socket).await });
        (peer, task)
    }

    async fn next_frame(peer: &mut SocketPeer) -> String {
        timeout(Duration::from_secs(1), peer.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
    }

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(n),
            candidate: format!("candidate:{n}"),
        }
    }

    #[tokio::test]
    async fn test_offer_gets_answer_frame() {
        let (station, log) = station();
        let (mut peer, _task) = connect(&station);

        peer.send(Message::IceCandidate(candidate(1)).to_text().unwrap())
            .await
            .unwrap();
        peer.send(Message::SdpOffer(SessionDescription::offer("offer")).to_text().unwrap())
            .await
            .unwrap();

        assert_eq!(
            next_frame(&mut peer).await,
            Message::SdpAnswer(SessionDescription::answer("answer-1"))
                .to_text()
                .unwrap()
        );
        assert_eq!(log.candidates.lock().unwrap().as_slice(), &[candidate(1)]);

        log.emit(PeerEvent::IceCandidate(candidate(2)));
        assert_eq!(
            next_frame(&mut peer).await,
            Message::IceCandidate(candidate(2)).to_text().unwrap()
        );
    }

    #[tokio::test]
    async fn test_answer_frame_precedes_candidates_gathered_while_answering() {
        let (station, log) = station();
        *log.gathered_on_describe.lock().unwrap() = Some(candidate(0));
        let (mut peer, _task) = connect(&station);

        peer.send(Message::SdpOffer(SessionDescription::offer("offer")).to_text().unwrap())
            .await
            .unwrap();

        assert_eq!(
            next_frame(&mut peer).await,
            Message::SdpAnswer(SessionDescription::answer("answer-1"))
                .to_text()
                .unwrap()
        );
        assert_eq!(
            next_frame(&mut peer).await,
            Message::IceCandidate(candidate(0)).to_text().unwrap()
        );
    }

    #[tokio::test]
    async fn test_notify_reaches_connected_parent() {
        let (station, _log) = station();
        assert!(!station.notify(EventMessage::now(EventKind::BabyIsCrying)));

        let (mut peer, _task) = connect(&station);
        let crying = EventMessage::now(EventKind::BabyIsCrying);
        timeout(Duration::from_secs(1), async {
            while !station.notify(crying.clone()) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            next_frame(&mut peer).await,
            Message::Event(crying).to_text().unwrap()
        );
    }

    #[tokio::test]
    async fn test_parent_events_are_republished() {
        let (station, _log) = station();
        let mut received = station.received_events();
        let (peer, _task) = connect(&station);

        let reset = EventMessage::now(EventKind::Reset);
        peer.send(Message::Event(reset.clone()).to_text().unwrap())
            .await
            .unwrap();
        assert_eq!(
            timeout(Duration::from_secs(1), received.recv())
                .await
                .unwrap()
                .unwrap(),
            reset
        );
    }

    #[tokio::test]
    async fn test_bad_offer_keeps_station_alive() {
        let (station, log) = station();
        let (mut peer, _task) = connect(&station);
        log.fail_remote.store(true, Ordering::SeqCst);
        peer.send(Message::SdpOffer(SessionDescription::offer("bad")).to_text().unwrap())
            .await
            .unwrap();

        timeout(Duration::from_secs(1), async {
            while EngineLog::count(&log.closed) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        log.fail_remote.store(false, Ordering::SeqCst);
        peer.send(Message::SdpOffer(SessionDescription::offer("good")).to_text().unwrap())
            .await
            .unwrap();
        assert_eq!(
            next_frame(&mut peer).await,
            Message::SdpAnswer(SessionDescription::answer("answer-2"))
                .to_text()
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_disconnect_stops_negotiation_for_next_parent() {
        let (station, log) = station();
        let (mut peer, task) = connect(&station);
        peer.send(Message::SdpOffer(SessionDescription::offer("offer")).to_text().unwrap())
            .await
            .unwrap();
        next_frame(&mut peer).await;

        peer.disconnect();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(EngineLog::count(&log.closed), 1);
        assert_eq!(station.negotiator().pending_candidates().await, 0);

        let (mut second, _task) = connect(&station);
        second
            .send(Message::SdpOffer(SessionDescription::offer("again")).to_text().unwrap())
            .await
            .unwrap();
        assert_eq!(
            next_frame(&mut second).await,
            Message::SdpAnswer(SessionDescription::answer("answer-2"))
                .to_text()
                .unwrap()
        );
    }
}

//! Multiplexes typed messages over one text socket.

use std::marker::PhantomData;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::codec::{DecoderRegistry, WireMessage};
use crate::socket::Socket;

/// Owns one socket and one decoder registry.
///
/// Inbound frames are decoded in arrival order and handed to `handler`;
/// frames no decoder recognizes are dropped. Messages received on `emitter`
/// are serialized and written in emission order. Nothing is retried: a read
/// or write failure marks the socket disconnected and the conductor is done.
/// A conductor is never reused after its socket closes.
pub struct Conductor<M> {
    id: u64,
    closed: Arc<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    _message: PhantomData<fn() -> M>,
}

impl<M: WireMessage> Conductor<M> {
    pub fn new(
        socket: Socket,
        emitter: mpsc::Receiver<M>,
        handler: mpsc::Sender<M>,
        registry: DecoderRegistry<M>,
    ) -> Self {
        let parts = socket.into_parts();
        let id = parts.id;
        let mut tasks = parts.io_tasks;

        tasks.push(tokio::spawn(receive_loop(
            id,
            parts.incoming,
            handler,
            registry,
            Arc::clone(&parts.closed),
        )));
        tasks.push(tokio::spawn(send_loop(
            id,
            emitter,
            parts.outgoing,
            Arc::clone(&parts.closed),
        )));
        debug!(socket = id, "conductor started");

        Self {
            id,
            closed: parts.closed,
            tasks,
            _message: PhantomData,
        }
    }
}

impl<M> Conductor<M> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Flips to `true` when the underlying socket is lost.
    pub fn disconnected(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl<M> Drop for Conductor<M> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        debug!(socket = self.id, "conductor dropped");
    }
}

async fn receive_loop<M>(
    id: u64,
    mut incoming: mpsc::Receiver<String>,
    handler: mpsc::Sender<M>,
    registry: DecoderRegistry<M>,
    closed: Arc<watch::Sender<bool>>,
) {
    while let Some(text) = incoming.recv().await {
        let Some(message) = registry.decode(&text) else {
            trace!(socket = id, len = text.len(), "dropping unrecognized frame");
            continue;
        };
        if handler.send(message).await.is_err() {
            debug!(socket = id, "message handler gone");
            return;
        }
    }
    debug!(socket = id, "inbound frames ended");
    closed.send_replace(true);
}

async fn send_loop<M: WireMessage>(
    id: u64,
    mut emitter: mpsc::Receiver<M>,
    outgoing: mpsc::Sender<String>,
    closed: Arc<watch::Sender<bool>>,
) {
    while let Some(message) = emitter.recv().await {
        let text = match message.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!(socket = id, error = %e, "failed to encode outbound message");
                continue;
            }
        };
        if outgoing.send(text).await.is_err() {
            warn!(socket = id, "socket closed while writing");
            closed.send_replace(true);
            return;
        }
    }
    debug!(socket = id, "outbound message stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::SocketPeer;
    use babylink_common::{IceCandidate, Message, SessionDescription};
    use std::time::Duration;
    use tokio::time::timeout;

    fn conductor() -> (
        Conductor<Message>,
        SocketPeer,
        mpsc::Sender<Message>,
        mpsc::Receiver<Message>,
    ) {
        let (socket, peer) = Socket::pair(16);
        let (emit_tx, emit_rx) = mpsc::channel(16);
        let (handle_tx, handle_rx) = mpsc::channel(16);
        let conductor = Conductor::new(socket, emit_rx, handle_tx, DecoderRegistry::all());
        (conductor, peer, emit_tx, handle_rx)
    }

    async fn next(rx: &mut mpsc::Receiver<Message>) -> Message {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("handler closed")
    }

    #[tokio::test]
    async fn test_unrecognized_frames_are_skipped_in_order() {
        let (_conductor, peer, _emit, mut handled) = conductor();

        peer.send(r#"{"iceCandidate":{"sdpMid":"0","sdpMLineIndex":0,"candidate":"c1"}}"#)
            .await
            .unwrap();
        peer.send(r#"{"hello":"world"}"#).await.unwrap();
        peer.send(r#"{"answerSDP":{"type":"answer","sdp":"v=0"}}"#)
            .await
            .unwrap();

        assert_eq!(
            next(&mut handled).await,
            Message::IceCandidate(IceCandidate {
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                candidate: "c1".into(),
            })
        );
        assert_eq!(
            next(&mut handled).await,
            Message::SdpAnswer(SessionDescription::answer("v=0"))
        );
        assert!(timeout(Duration::from_millis(50), handled.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_decoded_order_matches_arrival_order() {
        let (_conductor, peer, _emit, mut handled) = conductor();

        let mut expected = Vec::new();
        for i in 0..20 {
            if i % 3 == 0 {
                peer.send(format!("garbage-{i}")).await.unwrap();
            } else {
                let candidate = IceCandidate {
                    sdp_mid: None,
                    sdp_mline_index: Some(i),
                    candidate: format!("c{i}"),
                };
                let message = Message::IceCandidate(candidate);
                peer.send(message.to_text().unwrap()).await.unwrap();
                expected.push(message);
            }
        }

        for message in expected {
            assert_eq!(next(&mut handled).await, message);
        }
    }

    #[tokio::test]
    async fn test_outbound_messages_written_in_order() {
        let (_conductor, mut peer, emit, _handled) = conductor();

        let first = Message::SdpOffer(SessionDescription::offer("v=0"));
        let second = Message::IceCandidate(IceCandidate {
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            candidate: "c".into(),
        });
        emit.send(first.clone()).await.unwrap();
        emit.send(second.clone()).await.unwrap();

        assert_eq!(peer.recv().await.unwrap(), first.to_text().unwrap());
        assert_eq!(peer.recv().await.unwrap(), second.to_text().unwrap());
    }

    #[tokio::test]
    async fn test_peer_disconnect_closes_conductor() {
        let (conductor, mut peer, _emit, _handled) = conductor();
        let mut disconnected = conductor.disconnected();
        assert!(!conductor.is_closed());

        peer.disconnect();
        timeout(Duration::from_secs(1), disconnected.wait_for(|closed| *closed))
            .await
            .unwrap()
            .unwrap();
        assert!(conductor.is_closed());
    }

    #[tokio::test]
    async fn test_write_to_dropped_peer_marks_closed() {
        let (conductor, peer, emit, _handled) = conductor();
        let mut disconnected = conductor.disconnected();
        drop(peer);

        let _ = emit
            .send(Message::SdpOffer(SessionDescription::offer("v=0")))
            .await;
        timeout(Duration::from_secs(1), disconnected.wait_for(|closed| *closed))
            .await
            .unwrap()
            .unwrap();
    }
}

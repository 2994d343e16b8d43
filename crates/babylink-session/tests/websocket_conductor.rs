//! Conductor, parent and station over a real localhost WebSocket.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use babylink_common::{
    ConnectionState, EventKind, EventMessage, IceCandidate, Message, Result, SessionConfig,
    SessionDescription,
};
use babylink_session::{
    BabyStation, Conductor, DecoderRegistry, FixedEndpoint, LifecycleCoordinator,
    MediaConstraints, PeerConnection, PeerConnectionFactory, PeerEventSender, Socket,
    WebSocketConnector,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use url::Url;

const WAIT: Duration = Duration::from_secs(2);

/// Produces numbered descriptions and accepts everything.
#[derive(Default)]
struct EchoEngine {
    created: AtomicUsize,
}

struct EchoConnection(usize);

#[async_trait]
impl PeerConnectionFactory for EchoEngine {
    async fn peer_connection(&self, _events: PeerEventSender) -> Result<Box<dyn PeerConnection>> {
        let id = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(EchoConnection(id)))
    }
}

#[async_trait]
impl PeerConnection for EchoConnection {
    async fn create_offer(&self, _: &MediaConstraints) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(format!("offer-{}", self.0)))
    }

    async fn create_answer(&self, _: &MediaConstraints) -> Result<SessionDescription> {
        Ok(SessionDescription::answer(format!("answer-{}", self.0)))
    }

    async fn set_local_description(&self, _: SessionDescription) -> Result<()> {
        Ok(())
    }

    async fn set_remote_description(&self, _: SessionDescription) -> Result<()> {
        Ok(())
    }

    async fn add_ice_candidate(&self, _: IceCandidate) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

async fn listener() -> (TcpListener, Url) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = Url::parse(&format!("ws://{addr}")).unwrap();
    (listener, url)
}

#[tokio::test]
async fn test_conductor_over_websocket_keeps_order_and_skips_noise() {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        for frame in [
            r#"{"iceCandidate":{"sdpMid":"0","sdpMLineIndex":0,"candidate":"c1"}}"#,
            "definitely not a message",
            r#"{"answerSDP":{"type":"answer","sdp":"v=0"}}"#,
        ] {
            ws.send(WsMessage::Text(frame.to_string().into())).await.unwrap();
        }
        let echoed = ws.next().await.unwrap().unwrap();
        ws.close(None).await.unwrap();
        echoed.into_text().unwrap().to_string()
    });

    let socket = Socket::connect(&url, 16).await.unwrap();
    let (emit_tx, emit_rx) = mpsc::channel(16);
    let (handle_tx, mut handled) = mpsc::channel(16);
    let conductor = Conductor::new(socket, emit_rx, handle_tx, DecoderRegistry::all());
    let mut disconnected = conductor.disconnected();

    let first = timeout(WAIT, handled.recv()).await.unwrap().unwrap();
    let second = timeout(WAIT, handled.recv()).await.unwrap().unwrap();
    assert!(matches!(first, Message::IceCandidate(ref c) if c.candidate == "c1"));
    assert_eq!(second, Message::SdpAnswer(SessionDescription::answer("v=0")));

    let offer = Message::SdpOffer(SessionDescription::offer("v=0"));
    emit_tx.send(offer.clone()).await.unwrap();
    assert_eq!(
        timeout(WAIT, server).await.unwrap().unwrap(),
        offer.to_text().unwrap()
    );

    timeout(WAIT, disconnected.wait_for(|closed| *closed))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_parent_and_station_negotiate_and_exchange_events() {
    let (listener, url) = listener().await;
    let station = Arc::new(BabyStation::new(Arc::new(EchoEngine::default()), 16));
    let serving = {
        let station = Arc::clone(&station);
        tokio::spawn(async move { station.serve(listener).await })
    };

    let coordinator = LifecycleCoordinator::new(
        Arc::new(FixedEndpoint(url)),
        Arc::new(WebSocketConnector::new(16)),
        Arc::new(EchoEngine::default()),
        SessionConfig::default(),
    );
    let mut state = coordinator.state();
    let session = coordinator.session().await.unwrap();
    timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Streaming))
        .await
        .unwrap()
        .unwrap();

    let mut events = session.events();
    let crying = EventMessage::now(EventKind::BabyIsCrying);
    timeout(WAIT, async {
        while !station.notify(crying.clone()) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(timeout(WAIT, events.recv()).await.unwrap().unwrap(), crying);

    let mut received = station.received_events();
    let reset = EventMessage::now(EventKind::Reset);
    session.send_event(reset.clone()).await.unwrap();
    assert_eq!(timeout(WAIT, received.recv()).await.unwrap().unwrap(), reset);

    coordinator.shutdown().await;
    serving.abort();
}

//! babylink CLI: find the baby station, watch it as a parent, or run one.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use babylink_common::{
    config::STATION_WEBSOCKET_PORT, DiscoveryConfig, EventKind, EventMessage, SessionConfig,
};
use babylink_discovery::{MdnsBrowser, ServiceAdvertiser, ServiceResolver, TracingReporter};
use babylink_session::{
    BabyStation, DiscoveredEndpoint, EndpointProvider, FixedEndpoint, LifecycleCoordinator,
    LifecycleEvent, ParentSession, RtcPeerFactory, WebSocketConnector,
};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use url::Url;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "babylink")]
#[command(about = "Baby monitor signaling over the local network")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Look for a baby station and print its address
    Discover {
        /// Seconds to wait before giving up
        #[arg(long, env = "BABYLINK_SEARCH_TIMEOUT_SECS")]
        timeout: Option<u64>,
    },

    /// Connect to a baby station as a parent viewer
    ///
    /// Reads `background`, `foreground` and `quit` from stdin.
    Parent {
        /// Station URL; discovered over mDNS when omitted
        #[arg(long, env = "BABYLINK_CONNECT")]
        connect: Option<Url>,
        /// Seconds to wait for discovery before giving up
        #[arg(long, env = "BABYLINK_SEARCH_TIMEOUT_SECS")]
        timeout: Option<u64>,
    },

    /// Run a baby station
    ///
    /// Reads `cry` and `quit` from stdin.
    Baby {
        /// Address to accept parents on
        #[arg(long, env = "BABYLINK_LISTEN", default_value_t = default_listen())]
        listen: SocketAddr,
        /// Do not announce the station over mDNS
        #[arg(long, default_value = "false")]
        no_advertise: bool,
    },
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], STATION_WEBSOCKET_PORT))
}

#[tokio::main]
async fn main() -> Result<()> {
    babylink_common::init_tracing();

    let args = Args::parse();
    let discovery = DiscoveryConfig::from_env()?;
    let mut session = SessionConfig::from_env()?;

    match args.command {
        Command::Discover { timeout } => {
            if let Some(secs) = timeout {
                session.search_timeout = Duration::from_secs(secs);
            }
            discover(discovery, session).await
        }
        Command::Parent { connect, timeout } => {
            if let Some(secs) = timeout {
                session.search_timeout = Duration::from_secs(secs);
            }
            parent(discovery, session, connect).await
        }
        Command::Baby {
            listen,
            no_advertise,
        } => baby(discovery, session, listen, !no_advertise).await,
    }
}

fn resolver(discovery: DiscoveryConfig) -> Result<Arc<ServiceResolver>> {
    let browser = MdnsBrowser::new().context("starting mDNS browser")?;
    Ok(Arc::new(ServiceResolver::new(
        Arc::new(browser),
        Arc::new(TracingReporter),
        discovery,
    )))
}

async fn discover(discovery: DiscoveryConfig, session: SessionConfig) -> Result<()> {
    let resolver = resolver(discovery)?;
    let found = resolver.find(session.search_timeout).await?;
    println!("{}:{}", found.address, found.port);
    println!("{}", found.websocket_url()?);
    Ok(())
}

async fn parent(
    discovery: DiscoveryConfig,
    session: SessionConfig,
    connect: Option<Url>,
) -> Result<()> {
    let endpoint: Arc<dyn EndpointProvider> = match connect {
        Some(url) => Arc::new(FixedEndpoint(url)),
        None => Arc::new(DiscoveredEndpoint::new(
            resolver(discovery)?,
            session.search_timeout,
        )),
    };
    let peers = Arc::new(RtcPeerFactory::new(&session)?);
    let connector = Arc::new(WebSocketConnector::new(session.channel_capacity));
    let coordinator = LifecycleCoordinator::new(endpoint, connector, peers, session);

    let (lifecycle_tx, lifecycle_rx) = mpsc::channel(8);
    let listener = coordinator.spawn_lifecycle_listener(lifecycle_rx);
    let supervisor = tokio::spawn(supervise(Arc::clone(&coordinator)));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line?.as_deref().map(str::trim) {
                Some("background") => lifecycle_tx.send(LifecycleEvent::WillResignActive).await?,
                Some("foreground") => lifecycle_tx.send(LifecycleEvent::WillEnterForeground).await?,
                Some("quit") | None => break,
                Some("") => {}
                Some(other) => warn!(command = other, "unknown command"),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    supervisor.abort();
    drop(lifecycle_tx);
    let _ = listener.await;
    coordinator.shutdown().await;
    Ok(())
}

/// Keeps a session alive: every time one is lost, the next access rebuilds it.
async fn supervise(coordinator: Arc<LifecycleCoordinator>) {
    let mut state = coordinator.state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            info!(state = ?current, "connection state");
        }
    });

    loop {
        match coordinator.session().await {
            Ok(session) => watch_session(&session).await,
            Err(e) => warn!(error = %e, "could not connect to the baby station"),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn watch_session(session: &ParentSession) {
    let mut events = session.events();
    let mut media = session.media_stream();
    let mut disconnected = session.disconnected();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            changed = media.changed() => {
                if changed.is_err() {
                    return;
                }
                if let Some(stream) = media.borrow_and_update().as_ref() {
                    info!(stream = %stream.stream_id, kind = ?stream.kind, "receiving media");
                }
            }
            _ = async { let _ = disconnected.wait_for(|closed| *closed).await; } => return,
        }
    }
}

fn print_event(event: &EventMessage) {
    let at = event
        .timestamp
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    match event.action {
        EventKind::BabyIsCrying => println!("[{at}] baby is crying"),
        EventKind::Reset => println!("[{at}] reset"),
    }
}

async fn baby(
    discovery: DiscoveryConfig,
    session: SessionConfig,
    listen: SocketAddr,
    advertise: bool,
) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    let bound = listener.local_addr()?;
    if !discovery.allows_port(bound.port()) {
        warn!(port = bound.port(), "parents will not accept this port");
    }

    let _advertiser = if advertise {
        Some(ServiceAdvertiser::register(&discovery, bound).context("advertising station")?)
    } else {
        None
    };

    let peers = Arc::new(RtcPeerFactory::new(&session)?);
    let station = Arc::new(BabyStation::new(peers, session.channel_capacity));
    let serving = {
        let station = Arc::clone(&station);
        tokio::spawn(async move { station.serve(listener).await })
    };
    let mut received = station.received_events();
    info!(%bound, "baby station ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line?.as_deref().map(str::trim) {
                Some("cry") => {
                    if !station.notify(EventMessage::now(EventKind::BabyIsCrying)) {
                        println!("no parent connected");
                    }
                }
                Some("quit") | None => break,
                Some("") => {}
                Some(other) => warn!(command = other, "unknown command"),
            },
            event = received.recv() => {
                if let Ok(event) = event {
                    print_event(&event);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    serving.abort();
    station.negotiator().stop().await;
    Ok(())
}

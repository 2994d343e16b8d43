//! Signaling transport and media-session negotiation.
//!
//! A [`Conductor`] multiplexes typed [`Message`](babylink_common::Message)s over
//! one text [`Socket`], decoding inbound frames through a [`DecoderRegistry`].
//! The negotiators drive a single peer connection each: [`ClientNegotiator`]
//! on the parent (offerer) and [`ServerNegotiator`] on the baby station
//! (answerer). [`LifecycleCoordinator`] rebuilds the parent's per-session
//! services after a socket loss and pauses/resumes negotiation on app
//! lifecycle transitions.

#![forbid(unsafe_code)]

pub mod codec;
pub mod conductor;
pub mod endpoint;
pub mod lifecycle;
pub mod negotiator;
pub mod parent;
pub mod slot;
pub mod socket;
pub mod station;

pub use codec::{DecoderRegistry, MessageDecoder, WireMessage};
pub use conductor::Conductor;
pub use endpoint::{DiscoveredEndpoint, EndpointProvider, FixedEndpoint};
pub use lifecycle::{LifecycleCoordinator, LifecycleEvent};
pub use negotiator::{
    ClientNegotiator, LocalSignal, MediaConstraints, MediaKind, MediaStream, NegotiationState,
    PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSender, RtcPeerFactory,
    ServerNegotiator,
};
pub use parent::ParentSession;
pub use slot::ResettableSlot;
pub use socket::{Socket, SocketConnector, SocketPeer, WebSocketConnector};
pub use station::BabyStation;

//! Trial decoders for the structural wire shapes.
//!
//! Frames carry no discriminant, so a [`DecoderRegistry`] asks each decoder in
//! turn and the first match wins. The built-in shapes are disjoint (every
//! envelope rejects unknown keys), but order is still part of the contract
//! for registries that mix in custom decoders: earlier entries shadow later
//! ones on ambiguous frames.

use babylink_common::protocol::wire::{AnswerEnvelope, IceCandidateEnvelope, OfferEnvelope};
use babylink_common::{EventMessage, Message, Result, SdpType};

/// A message that can be written to the socket as text.
pub trait WireMessage: Send + 'static {
    fn to_text(&self) -> Result<String>;
}

impl WireMessage for Message {
    fn to_text(&self) -> Result<String> {
        Message::to_text(self)
    }
}

/// Recognizes one wire shape. Must be pure: a miss is `None`, never an error.
pub trait MessageDecoder<M>: Send + Sync {
    fn decode(&self, text: &str) -> Option<M>;
}

impl<M, F> MessageDecoder<M> for F
where
    F: Fn(&str) -> Option<M> + Send + Sync,
{
    fn decode(&self, text: &str) -> Option<M> {
        self(text)
    }
}

/// `{"offerSDP": {"type": "offer", ...}}`
#[derive(Debug, Default, Clone, Copy)]
pub struct SdpOfferDecoder;

impl MessageDecoder<Message> for SdpOfferDecoder {
    fn decode(&self, text: &str) -> Option<Message> {
        let envelope: OfferEnvelope = serde_json::from_str(text).ok()?;
        (envelope.offer_sdp.sdp_type == SdpType::Offer).then_some(Message::SdpOffer(envelope.offer_sdp))
    }
}

/// `{"answerSDP": {"type": "answer", ...}}`
#[derive(Debug, Default, Clone, Copy)]
pub struct SdpAnswerDecoder;

impl MessageDecoder<Message> for SdpAnswerDecoder {
    fn decode(&self, text: &str) -> Option<Message> {
        let envelope: AnswerEnvelope = serde_json::from_str(text).ok()?;
        matches!(
            envelope.answer_sdp.sdp_type,
            SdpType::Answer | SdpType::PrAnswer
        )
        .then_some(Message::SdpAnswer(envelope.answer_sdp))
    }
}

/// `{"iceCandidate": {...}}`
#[derive(Debug, Default, Clone, Copy)]
pub struct IceCandidateDecoder;

impl MessageDecoder<Message> for IceCandidateDecoder {
    fn decode(&self, text: &str) -> Option<Message> {
        let envelope: IceCandidateEnvelope = serde_json::from_str(text).ok()?;
        Some(Message::IceCandidate(envelope.ice_candidate))
    }
}

/// `{"action": "...", "timestamp": "..."}`
#[derive(Debug, Default, Clone, Copy)]
pub struct EventMessageDecoder;

impl MessageDecoder<Message> for EventMessageDecoder {
    fn decode(&self, text: &str) -> Option<Message> {
        serde_json::from_str::<EventMessage>(text).ok().map(Message::Event)
    }
}

/// Ordered list of decoders.
pub struct DecoderRegistry<M> {
    decoders: Vec<Box<dyn MessageDecoder<M>>>,
}

impl<M> Default for DecoderRegistry<M> {
    fn default() -> Self {
        Self {
            decoders: Vec::new(),
        }
    }
}

impl<M> DecoderRegistry<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a decoder; it is tried after every decoder already registered.
    pub fn with(mut self, decoder: impl MessageDecoder<M> + 'static) -> Self {
        self.decoders.push(Box::new(decoder));
        self
    }

    pub fn decode(&self, text: &str) -> Option<M> {
        self.decoders.iter().find_map(|decoder| decoder.decode(text))
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl DecoderRegistry<Message> {
    /// Offer, answer, ICE candidate.
    pub fn rtc() -> Self {
        Self::new()
            .with(SdpOfferDecoder)
            .with(SdpAnswerDecoder)
            .with(IceCandidateDecoder)
    }

    /// Application events only.
    pub fn events() -> Self {
        Self::new().with(EventMessageDecoder)
    }

    /// Offer, answer, ICE candidate, then application events.
    pub fn all() -> Self {
        Self::rtc().with(EventMessageDecoder)
    }
}

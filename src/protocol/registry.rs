//! Message registry
//!
//! Maps inbound IDs to decoders and outbound message types to IDs. A server
//! or client owns one registry; every connection it spawns consults it.

use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::codec::{self, CodecResult, Decode, Decoder, Encode};
use super::{
    validate_user_id, ControlMessage, Direction, Frame, InvalidMessage, MessageId, ProtocolError,
    ProtocolResult,
};

/// Builds an inbound message from its payload
pub type DecodeFn<M> = Arc<dyn Fn(&mut Decoder<'_>) -> CodecResult<M> + Send + Sync>;

/// Outcome of decoding one received line
#[derive(Debug)]
pub enum Decoded<M> {
    /// A control message, handled by the connection
    Control(ControlMessage),
    /// An application message
    Message { id: MessageId, body: M },
    /// Anything that could not be decoded
    Invalid(InvalidMessage),
}

/// Registry of inbound decoders and outbound IDs
pub struct MessageRegistry<M> {
    inbound: HashMap<MessageId, DecodeFn<M>>,
    outbound: HashMap<TypeId, MessageId>,
    outbound_ids: HashMap<MessageId, &'static str>,
}

impl<M> MessageRegistry<M> {
    pub fn new() -> Self {
        Self {
            inbound: HashMap::new(),
            outbound: HashMap::new(),
            outbound_ids: HashMap::new(),
        }
    }

    /// Register a decoder for inbound messages with `id`
    pub fn register_inbound<F>(&mut self, id: MessageId, decode: F) -> ProtocolResult<()>
    where
        F: Fn(&mut Decoder<'_>) -> CodecResult<M> + Send + Sync + 'static,
    {
        validate_user_id(id)?;
        if self.inbound.contains_key(&id) {
            return Err(ProtocolError::AlreadyRegistered {
                id,
                direction: Direction::Inbound,
            });
        }
        self.inbound.insert(id, Arc::new(decode));
        Ok(())
    }

    /// Register a decodable type for inbound messages with `id`
    pub fn register_inbound_type<T>(&mut self, id: MessageId) -> ProtocolResult<()>
    where
        T: Decode + Into<M> + 'static,
        M: 'static,
    {
        self.register_inbound(id, |dec| T::decode(dec).map(Into::into))
    }

    /// Register the outbound type `T` as message `id`
    pub fn register_outbound<T: Encode + 'static>(&mut self, id: MessageId) -> ProtocolResult<()> {
        validate_user_id(id)?;
        if self.outbound_ids.contains_key(&id) || self.outbound.contains_key(&TypeId::of::<T>()) {
            return Err(ProtocolError::AlreadyRegistered {
                id,
                direction: Direction::Outbound,
            });
        }
        self.outbound.insert(TypeId::of::<T>(), id);
        self.outbound_ids.insert(id, type_name::<T>());
        Ok(())
    }

    pub fn is_inbound_registered(&self, id: MessageId) -> bool {
        self.inbound.contains_key(&id)
    }

    /// The ID `T` is sent with, if registered
    pub fn outbound_id<T: 'static>(&self) -> Option<MessageId> {
        self.outbound.get(&TypeId::of::<T>()).copied()
    }

    /// Frame an outbound message
    pub fn encode_outbound<T: Encode + 'static>(&self, message: &T) -> ProtocolResult<Frame> {
        let id = self
            .outbound_id::<T>()
            .ok_or(ProtocolError::UnregisteredType(type_name::<T>()))?;
        let payload = codec::encode(message)?;
        Ok(Frame::new(id, payload))
    }

    /// Frame and render an outbound message as a wire line
    pub fn encode_line<T: Encode + 'static>(&self, message: &T) -> ProtocolResult<String> {
        Ok(self.encode_outbound(message)?.encode()?)
    }

    /// Decode one received line. Never fails: problems become [`Decoded::Invalid`].
    pub fn decode_line(&self, line: &str) -> Decoded<M> {
        let frame = match Frame::parse(line) {
            Ok(frame) => frame,
            Err(e) => return Decoded::Invalid(InvalidMessage::new(None, line, e.into())),
        };

        if let Some(control) = ControlMessage::from_id(frame.id) {
            if frame.payload.is_empty() {
                return Decoded::Control(control);
            }
            let cause = ProtocolError::ControlBody {
                id: frame.id,
                body: frame.payload.clone(),
            };
            return Decoded::Invalid(InvalidMessage::new(Some(frame.id), line, cause));
        }

        let Some(decode) = self.inbound.get(&frame.id) else {
            let cause = ProtocolError::UnknownMessageId(frame.id);
            return Decoded::Invalid(InvalidMessage::new(Some(frame.id), line, cause));
        };

        let mut dec = Decoder::new(&frame.payload);
        let result = decode(&mut dec).and_then(|body| dec.finish().map(|_| body));
        match result {
            Ok(body) => Decoded::Message { id: frame.id, body },
            Err(e) => Decoded::Invalid(InvalidMessage::new(Some(frame.id), line, e.into())),
        }
    }
}

impl<M> Default for MessageRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Clone for MessageRegistry<M> {
    fn clone(&self) -> Self {
        Self {
            inbound: self.inbound.clone(),
            outbound: self.outbound.clone(),
            outbound_ids: self.outbound_ids.clone(),
        }
    }
}

impl<M> fmt::Debug for MessageRegistry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut inbound: Vec<_> = self.inbound.keys().copied().collect();
        inbound.sort_unstable();
        f.debug_struct("MessageRegistry")
            .field("inbound", &inbound)
            .field("outbound", &self.outbound_ids)
            .finish()
    }
}

//! Wire-protocol message types for the Weft RPC transport.
//!
//! Every datagram carries one [`Message`]: a request, a response, or an
//! error reply, each under a common envelope of message id and sender node
//! id. Payload values are expressed as a small self-describing primitive
//! tree ([`Value`]) so the codec preserves integers, byte strings, ordered
//! sequences and key-value maps without a per-method schema.

use std::collections::BTreeMap;
use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use weft_types::Key;

use crate::{codec, TransportError};

/// Maximum size of an encoded datagram (to prevent allocation attacks).
pub const MAX_DATAGRAM_SIZE: usize = 8192;

/// A random 160-bit message identifier used to correlate replies.
///
/// Message ids share the identifier width of node ids but are freshly
/// generated per request and never derived from a node id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId([u8; 20]);

impl MessageId {
    /// Generate a fresh random message id.
    pub fn random() -> Self {
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(self.0))
    }
}

/// A self-describing primitive value tree.
///
/// This is the argument and result representation for every RPC: integers,
/// byte strings, UTF-8 strings, ordered lists and byte-keyed maps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// A signed integer.
    Int(i64),
    /// An opaque byte string.
    Bytes(Vec<u8>),
    /// A UTF-8 string.
    Str(String),
    /// An ordered sequence of values.
    List(Vec<Value>),
    /// A map with byte-string keys.
    Map(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// Wrap a key as a byte-string value.
    pub fn key(key: &Key) -> Self {
        Value::Bytes(key.to_vec())
    }

    /// Borrow the integer, if this is an [`Value::Int`].
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Borrow the bytes, if this is a [`Value::Bytes`].
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Borrow the string, if this is a [`Value::Str`].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the list, if this is a [`Value::List`].
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Borrow the map, if this is a [`Value::Map`].
    pub fn as_map(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Decode the bytes as a [`Key`], if this is a 20-byte byte string.
    pub fn as_key(&self) -> Option<Key> {
        self.as_bytes().and_then(Key::from_bytes)
    }
}

/// A wire message: one of the three envelope variants.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    /// An RPC request naming a method and carrying its arguments.
    Request {
        /// Correlation id, echoed by the reply.
        id: MessageId,
        /// The sender's node id.
        sender: Key,
        /// The RPC method name.
        method: String,
        /// Positional arguments.
        args: Vec<Value>,
    },
    /// A successful reply to a request.
    Response {
        /// Correlation id of the request being answered.
        id: MessageId,
        /// The sender's node id.
        sender: Key,
        /// The handler's result.
        result: Value,
    },
    /// An error reply to a request.
    Error {
        /// Correlation id of the request being answered.
        id: MessageId,
        /// The sender's node id.
        sender: Key,
        /// The error kind name, preserved across the wire.
        kind: String,
        /// Human-readable error text.
        text: String,
    },
}

impl Message {
    /// The correlation id of this message.
    pub fn id(&self) -> MessageId {
        match self {
            Message::Request { id, .. }
            | Message::Response { id, .. }
            | Message::Error { id, .. } => *id,
        }
    }

    /// The sender's node id.
    pub fn sender(&self) -> Key {
        match self {
            Message::Request { sender, .. }
            | Message::Response { sender, .. }
            | Message::Error { sender, .. } => *sender,
        }
    }

    /// Serialize this message to CBOR bytes for transmission.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ProtocolViolation`] if the encoded message
    /// exceeds [`MAX_DATAGRAM_SIZE`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        let bytes = codec::to_vec(self)?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::ProtocolViolation(format!(
                "message too large: {} bytes, max {MAX_DATAGRAM_SIZE}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    /// Deserialize a message from bytes received from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Deserialization`] for malformed input;
    /// decoding never panics.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::ProtocolViolation(format!(
                "datagram too large: {} bytes, max {MAX_DATAGRAM_SIZE}",
                data.len()
            )));
        }
        codec::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_randomness() {
        assert_ne!(MessageId::random(), MessageId::random());
    }

    #[test]
    fn test_request_roundtrip() {
        let sender = Key::generate();
        let msg = Message::Request {
            id: MessageId::random(),
            sender,
            method: "find_node".to_string(),
            args: vec![Value::key(&Key::generate()), Value::Int(3)],
        };
        let bytes = msg.to_bytes().expect("serialize");
        let restored = Message::from_bytes(&bytes).expect("deserialize");
        assert_eq!(restored.id(), msg.id());
        assert_eq!(restored.sender(), sender);
        assert!(matches!(
            restored,
            Message::Request { ref method, ref args, .. }
                if method == "find_node" && args.len() == 2
        ));
    }

    #[test]
    fn test_error_roundtrip_preserves_kind() {
        let msg = Message::Error {
            id: MessageId::random(),
            sender: Key::generate(),
            kind: "InvalidMethod".to_string(),
            text: "no such method: frobnicate".to_string(),
        };
        let bytes = msg.to_bytes().expect("serialize");
        let restored = Message::from_bytes(&bytes).expect("deserialize");
        assert!(matches!(
            restored,
            Message::Error { ref kind, ref text, .. }
                if kind == "InvalidMethod" && text.contains("frobnicate")
        ));
    }

    #[test]
    fn test_malformed_input_rejected() {
        assert!(Message::from_bytes(&[0x00, 0x01, 0x02]).is_err());
        assert!(Message::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_oversized_message_rejected() {
        let msg = Message::Response {
            id: MessageId::random(),
            sender: Key::generate(),
            result: Value::Bytes(vec![0u8; MAX_DATAGRAM_SIZE]),
        };
        assert!(msg.to_bytes().is_err());
    }

    #[test]
    fn test_value_accessors() {
        let key = Key::generate();
        assert_eq!(Value::Int(7).as_int(), Some(7));
        assert_eq!(Value::Str("pong".into()).as_str(), Some("pong"));
        assert_eq!(Value::key(&key).as_key(), Some(key));
        assert!(Value::Int(7).as_bytes().is_none());
        let map = BTreeMap::from([(key.to_vec(), Value::Int(1))]);
        assert!(Value::Map(map).as_map().is_some());
    }
}

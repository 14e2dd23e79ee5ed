//! Protocol messages exchanged between nodes
//!
//! Wire payloads use bincode (standard config, big-endian). Framing is handled
//! by [`crate::transport::framing`]. Variant order is part of the wire format:
//! `Request` encodes as tag 0 and `Token` as tag 1.
use bincode::{Decode, Encode};

use super::{NodeId, TokenRecord};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Decode, Encode)]
pub enum Message {
    /// Ask every peer for the token
    Request { sender: NodeId, clock: u64 },

    /// Hand the token to the receiver
    Token {
        sender: NodeId,
        clock: u64,
        token: TokenRecord,
    },
}

impl Message {
    pub fn sender(&self) -> NodeId {
        match self {
            Message::Request { sender, .. } | Message::Token { sender, .. } => *sender,
        }
    }

    pub fn clock(&self) -> u64 {
        match self {
            Message::Request { clock, .. } | Message::Token { clock, .. } => *clock,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request { .. } => "REQUEST",
            Message::Token { .. } => "TOKEN",
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, wire_config())?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let (message, _) = bincode::decode_from_slice(data, wire_config())?;
        Ok(message)
    }
}

/// First frame on every connection: who is dialing, and how big it thinks the
/// cluster is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Decode, Encode)]
pub struct Handshake {
    pub node_id: NodeId,
    pub cluster_size: u32,
}

impl Handshake {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, wire_config())?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let (handshake, _) = bincode::decode_from_slice(data, wire_config())?;
        Ok(handshake)
    }
}

fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_big_endian()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_message_serialization() {
        let message = Message::Token {
            sender: NodeId::new(2),
            clock: 17,
            token: TokenRecord::from_vec(vec![3, 0, 16]),
        };

        let serialized = message.serialize().expect("Failed to serialize message");
        let deserialized = Message::deserialize(&serialized).expect("Failed to deserialize");

        match deserialized {
            Message::Token {
                sender,
                clock,
                token,
            } => {
                assert_eq!(sender, NodeId::new(2));
                assert_eq!(clock, 17);
                assert_eq!(token.as_slice(), &[3, 0, 16]);
            }
            _ => panic!("Wrong message type after deserialization"),
        }
    }

    #[test]
    fn test_variant_tags_on_the_wire() {
        let request = Message::Request {
            sender: NodeId::new(1),
            clock: 1,
        }
        .serialize()
        .unwrap();
        let token = Message::Token {
            sender: NodeId::new(1),
            clock: 1,
            token: TokenRecord::new(1),
        }
        .serialize()
        .unwrap();

        assert_eq!(request[0], 0);
        assert_eq!(token[0], 1);
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let data = Message::Token {
            sender: NodeId::new(0),
            clock: 4,
            token: TokenRecord::from_vec(vec![1, 2, 3, 4]),
        }
        .serialize()
        .unwrap();

        assert!(Message::deserialize(&data[..data.len() - 2]).is_err());
        assert!(Message::deserialize(&[9, 9, 9]).is_err());
    }

    #[test]
    fn test_handshake_serialization() {
        let handshake = Handshake {
            node_id: NodeId::new(3),
            cluster_size: 5,
        };
        let data = handshake.serialize().unwrap();
        assert_eq!(Handshake::deserialize(&data).unwrap(), handshake);
    }
}

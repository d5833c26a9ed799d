//! Control-plane messages exchanged with the rendezvous server.

use serde::{Deserialize, Serialize};

use crate::directory::PeerId;
use crate::error::{Error, Result};
use crate::protocol::Message;
use crate::room::RoomId;

/// Client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Register as the sender of a new room
    CreateRoom,
    /// Join an existing room as a receiver
    JoinRoom {
        /// Room to join, as typed by the user
        #[serde(rename = "roomId")]
        room_id: String,
    },
    /// Forward an opaque connection-setup payload to another peer
    RelaySetup {
        /// Recipient
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        /// Opaque payload
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    /// Leave the current room without closing the connection
    PeerDisconnect,
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// A room was created for the requesting sender
    RoomCreated {
        /// The new room id
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },
    /// A receiver joined the room (sent to the sender)
    Init {
        /// The joining receiver
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// A receiver joined the room (sent to the sender)
    PeerJoined {
        /// The joining receiver
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// Receiver count of the room changed
    MembershipChanged {
        /// Receivers now in the room
        count: usize,
    },
    /// The join succeeded (sent to the receiver)
    RoomJoined {
        /// The joined room
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },
    /// No sender is registered for the requested room
    NoSender {
        /// Human-readable reason
        message: String,
    },
    /// Connection-setup payload from another peer
    RelaySetup {
        /// Originating peer
        from: PeerId,
        /// Opaque payload
        payload: serde_json::Value,
    },
    /// A receiver left the room (sent to the sender)
    PeerLeft {
        /// The departed receiver
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// The sender left; the room no longer exists
    SenderLeft,
    /// A request could not be processed
    Error {
        /// Human-readable reason
        message: String,
    },
}

impl ClientMessage {
    /// Encode as a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_message(&self) -> Result<Message> {
        Message::json(self)
    }

    /// Decode from a frame.
    ///
    /// # Errors
    ///
    /// Returns an error for binary frames and malformed JSON.
    pub fn from_message(message: &Message) -> Result<Self> {
        decode(message)
    }
}

impl ServerMessage {
    /// Name of the message type, as it appears on the wire.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::RoomCreated { .. } => "room-created",
            Self::Init { .. } => "init",
            Self::PeerJoined { .. } => "peer-joined",
            Self::MembershipChanged { .. } => "membership-changed",
            Self::RoomJoined { .. } => "room-joined",
            Self::NoSender { .. } => "no-sender",
            Self::RelaySetup { .. } => "relay-setup",
            Self::PeerLeft { .. } => "peer-left",
            Self::SenderLeft => "sender-left",
            Self::Error { .. } => "error",
        }
    }

    /// Encode as a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_message(&self) -> Result<Message> {
        Message::json(self)
    }

    /// Decode from a frame.
    ///
    /// # Errors
    ///
    /// Returns an error for binary frames and malformed JSON.
    pub fn from_message(message: &Message) -> Result<Self> {
        decode(message)
    }
}

fn decode<T: serde::de::DeserializeOwned>(message: &Message) -> Result<T> {
    match message {
        Message::Text(text) => {
            serde_json::from_str(text).map_err(|e| Error::Serialization(e.to_string()))
        }
        Message::Binary(_) => Err(Error::UnexpectedMessage {
            expected: "text frame".to_string(),
            actual: "binary frame".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_wire_names() {
        let join = serde_json::to_value(ClientMessage::JoinRoom {
            room_id: "123456".to_string(),
        })
        .unwrap();
        assert_eq!(join, json!({"type": "join-room", "roomId": "123456"}));

        let create = serde_json::to_value(ClientMessage::CreateRoom).unwrap();
        assert_eq!(create, json!({"type": "create-room"}));
    }

    #[test]
    fn test_relay_without_fields_parses() {
        let parsed: ClientMessage = serde_json::from_value(json!({"type": "relay-setup"})).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::RelaySetup {
                to: None,
                payload: None
            }
        );
    }

    #[test]
    fn test_server_wire_names() {
        let room_id = RoomId::parse("654321").unwrap();
        let created = ServerMessage::RoomCreated { room_id };
        assert_eq!(
            serde_json::to_value(&created).unwrap(),
            json!({"type": "room-created", "roomId": "654321"})
        );

        let count = ServerMessage::MembershipChanged { count: 3 };
        assert_eq!(
            serde_json::to_value(&count).unwrap(),
            json!({"type": "membership-changed", "count": 3})
        );

        assert_eq!(
            serde_json::to_value(ServerMessage::SenderLeft).unwrap(),
            json!({"type": "sender-left"})
        );
    }

    #[test]
    fn test_type_name_matches_wire() {
        let messages = [
            ServerMessage::Init {
                peer_id: PeerId::from("p"),
            },
            ServerMessage::NoSender {
                message: "x".to_string(),
            },
            ServerMessage::SenderLeft,
        ];
        for message in messages {
            let value = serde_json::to_value(&message).unwrap();
            assert_eq!(value["type"], message.type_name());
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let message = ServerMessage::RelaySetup {
            from: PeerId::from("abc"),
            payload: json!({"addr": "10.0.0.2:9000"}),
        };
        let frame = message.to_message().unwrap();
        assert_eq!(ServerMessage::from_message(&frame).unwrap(), message);
    }

    #[test]
    fn test_binary_frame_rejected() {
        let result = ClientMessage::from_message(&Message::Binary(vec![1, 2]));
        assert!(matches!(result, Err(Error::UnexpectedMessage { .. })));
    }
}

//! Rendezvous directory.
//!
//! The directory maps each room id to one sender and a set of receivers,
//! relays opaque connection-setup payloads between peers, and notifies
//! peers of membership changes.
//!
//! All state lives behind a single async mutex, so every operation is
//! atomic with respect to every other: no lost receiver-set updates and no
//! room observed half torn down.
//!
//! ## Example
//!
//! ```rust,ignore
//! use roomdrop_core::directory::Directory;
//!
//! let directory = Directory::new();
//! let (sender, mut sender_mailbox) = directory.register().await;
//! let (receiver, _) = directory.register().await;
//!
//! let room = directory.create_room(&sender).await?;
//! directory.join_room(&room, &receiver).await?;
//! // sender_mailbox: room-created, init, peer-joined, membership-changed
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::room::{RoomId, RoomIdGenerator, ROOM_ID_MAX, ROOM_ID_MIN};
use crate::signaling::ServerMessage;

/// Identity of a connected peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh random peer id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Mailbox a peer receives its notifications on.
pub type Mailbox = mpsc::UnboundedReceiver<ServerMessage>;

#[derive(Debug, Clone)]
enum Membership {
    Sender(RoomId),
    Receiver(RoomId),
}

#[derive(Debug)]
struct Peer {
    mailbox: mpsc::UnboundedSender<ServerMessage>,
    membership: Option<Membership>,
}

#[derive(Debug)]
struct Room {
    sender: PeerId,
    receivers: BTreeSet<PeerId>,
}

#[derive(Debug, Default)]
struct State {
    peers: HashMap<PeerId, Peer>,
    rooms: HashMap<RoomId, Room>,
}

impl State {
    fn notify(&self, peer: &PeerId, message: ServerMessage) {
        match self.peers.get(peer) {
            Some(entry) => {
                if entry.mailbox.send(message).is_err() {
                    tracing::debug!("Mailbox of {} is gone", peer);
                }
            }
            None => tracing::debug!("Dropping {} for unknown peer {}", message.type_name(), peer),
        }
    }

    fn peer_mut(&mut self, peer: &PeerId) -> Result<&mut Peer> {
        self.peers
            .get_mut(peer)
            .ok_or_else(|| Error::ProtocolError(format!("unknown peer {peer}")))
    }

    fn leave(&mut self, peer: &PeerId) {
        let Some(membership) = self.peers.get_mut(peer).and_then(|p| p.membership.take()) else {
            return;
        };

        match membership {
            Membership::Sender(room_id) => {
                let Some(room) = self.rooms.remove(&room_id) else {
                    return;
                };
                tracing::info!(
                    "Room {} closed, notifying {} receiver(s)",
                    room_id,
                    room.receivers.len()
                );
                for receiver in &room.receivers {
                    if let Some(entry) = self.peers.get_mut(receiver) {
                        entry.membership = None;
                    }
                    self.notify(receiver, ServerMessage::SenderLeft);
                }
            }
            Membership::Receiver(room_id) => {
                let Some(room) = self.rooms.get_mut(&room_id) else {
                    return;
                };
                room.receivers.remove(peer);
                let sender = room.sender.clone();
                let count = room.receivers.len();
                tracing::debug!("Receiver {} left room {}", peer, room_id);
                self.notify(
                    &sender,
                    ServerMessage::PeerLeft {
                        peer_id: peer.clone(),
                    },
                );
                self.notify(&sender, ServerMessage::MembershipChanged { count });
            }
        }
    }
}

/// Shared handle to the rendezvous directory.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    state: Arc<Mutex<State>>,
}

impl Directory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new peer and hand out its id and mailbox.
    pub async fn register(&self) -> (PeerId, Mailbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = PeerId::random();
        self.state.lock().await.peers.insert(
            peer.clone(),
            Peer {
                mailbox: tx,
                membership: None,
            },
        );
        tracing::debug!("Peer {} registered", peer);
        (peer, rx)
    }

    /// Deliver a message to one peer's mailbox, if it is still connected.
    pub async fn send_to(&self, peer: &PeerId, message: ServerMessage) {
        self.state.lock().await.notify(peer, message);
    }

    /// Create a room with `peer` as its sender.
    ///
    /// A peer already in a room leaves it first; a sender's old room is torn
    /// down. The new id is also delivered as `room-created`.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is not registered or every room id is
    /// in use.
    pub async fn create_room(&self, peer: &PeerId) -> Result<RoomId> {
        let mut state = self.state.lock().await;
        state.peer_mut(peer)?;
        state.leave(peer);

        let capacity = (ROOM_ID_MAX - ROOM_ID_MIN + 1) as usize;
        let generator = RoomIdGenerator::new();
        let room_id = loop {
            match generator.generate_unique(|id| state.rooms.contains_key(id)) {
                Ok(id) => break id,
                Err(Error::RoomIdCollision) if state.rooms.len() < capacity => {
                    tracing::debug!("Room id space crowded, retrying");
                }
                Err(e) => return Err(e),
            }
        };

        state.rooms.insert(
            room_id.clone(),
            Room {
                sender: peer.clone(),
                receivers: BTreeSet::new(),
            },
        );
        state.peer_mut(peer)?.membership = Some(Membership::Sender(room_id.clone()));
        state.notify(
            peer,
            ServerMessage::RoomCreated {
                room_id: room_id.clone(),
            },
        );

        tracing::info!("Room {} created by {}", room_id, peer);
        Ok(room_id)
    }

    /// Add `peer` as a receiver of `room_id`.
    ///
    /// On success the sender is notified with `init`, `peer-joined` and
    /// `membership-changed`, and the receiver with `room-joined`. Returns
    /// the receiver count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RoomNotFound`] if no sender is registered for the
    /// room; nobody is notified in that case.
    pub async fn join_room(&self, room_id: &RoomId, peer: &PeerId) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.peer_mut(peer)?;

        let Some(room) = state.rooms.get(room_id) else {
            tracing::debug!("Join of unknown room {} by {}", room_id, peer);
            return Err(Error::RoomNotFound(room_id.to_string()));
        };
        if room.sender == *peer {
            return Err(Error::ProtocolError(
                "a sender cannot join its own room".to_string(),
            ));
        }
        if room.receivers.contains(peer) {
            return Ok(room.receivers.len());
        }

        state.leave(peer);

        let Some(room) = state.rooms.get_mut(room_id) else {
            return Err(Error::RoomNotFound(room_id.to_string()));
        };
        room.receivers.insert(peer.clone());
        let sender = room.sender.clone();
        let count = room.receivers.len();
        state.peer_mut(peer)?.membership = Some(Membership::Receiver(room_id.clone()));

        state.notify(
            &sender,
            ServerMessage::Init {
                peer_id: peer.clone(),
            },
        );
        state.notify(
            &sender,
            ServerMessage::PeerJoined {
                peer_id: peer.clone(),
            },
        );
        state.notify(&sender, ServerMessage::MembershipChanged { count });
        state.notify(
            peer,
            ServerMessage::RoomJoined {
                room_id: room_id.clone(),
            },
        );

        tracing::info!("{} joined room {} ({} receiver(s))", peer, room_id, count);
        Ok(count)
    }

    /// Forward an opaque payload to `to`, annotated with `from`.
    ///
    /// Silently dropped when `to` is not connected.
    pub async fn relay(&self, from: &PeerId, to: &PeerId, payload: serde_json::Value) {
        let state = self.state.lock().await;
        if !state.peers.contains_key(to) {
            tracing::debug!("Relay from {} to disconnected {} dropped", from, to);
            return;
        }
        state.notify(
            to,
            ServerMessage::RelaySetup {
                from: from.clone(),
                payload,
            },
        );
    }

    /// Remove `peer` from whatever room it is in.
    ///
    /// A departing sender destroys its room and every receiver is told
    /// `sender-left`; a departing receiver is reported to the sender with
    /// `peer-left` and the new count.
    pub async fn leave(&self, peer: &PeerId) {
        self.state.lock().await.leave(peer);
    }

    /// Leave, then forget the peer and close its mailbox.
    pub async fn disconnect(&self, peer: &PeerId) {
        let mut state = self.state.lock().await;
        state.leave(peer);
        if state.peers.remove(peer).is_some() {
            tracing::debug!("Peer {} disconnected", peer);
        }
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.state.lock().await.rooms.len()
    }

    /// Number of registered peers.
    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    /// Receivers of a room, or `None` if the room does not exist.
    pub async fn receivers(&self, room_id: &RoomId) -> Option<Vec<PeerId>> {
        self.state
            .lock()
            .await
            .rooms
            .get(room_id)
            .map(|room| room.receivers.iter().cloned().collect())
    }

    /// Room a peer is in, as sender or receiver.
    pub async fn room_of(&self, peer: &PeerId) -> Option<RoomId> {
        let state = self.state.lock().await;
        match state.peers.get(peer)?.membership.as_ref()? {
            Membership::Sender(room) | Membership::Receiver(room) => Some(room.clone()),
        }
    }
}

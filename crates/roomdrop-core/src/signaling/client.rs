//! Rendezvous client.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::ToSocketAddrs;

use super::message::{ClientMessage, ServerMessage};
use crate::channel::{Channel, TcpChannel};
use crate::directory::PeerId;
use crate::error::{Error, Result};
use crate::room::RoomId;

/// How long the request helpers wait for the server's reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection to a rendezvous server.
///
/// Messages that arrive while a helper such as [`create_room`] waits for its
/// reply are kept and returned by later [`recv`] calls, in order.
///
/// [`create_room`]: SignalingClient::create_room
/// [`recv`]: SignalingClient::recv
#[derive(Debug)]
pub struct SignalingClient {
    channel: TcpChannel,
    backlog: VecDeque<ServerMessage>,
}

impl SignalingClient {
    /// Connect to a server.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let channel = TcpChannel::connect(addr).await?;
        tracing::debug!("Connected to rendezvous server {}", channel.peer_addr());
        Ok(Self {
            channel,
            backlog: VecDeque::new(),
        })
    }

    /// Address of the server.
    #[must_use]
    pub fn server_addr(&self) -> SocketAddr {
        self.channel.peer_addr()
    }

    /// Local address of the connection, i.e. the interface that reaches
    /// the server.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.channel.local_addr()
    }

    /// Send a request.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn send(&self, message: &ClientMessage) -> Result<()> {
        self.channel.send(message.to_message()?)
    }

    /// Next server message, `None` once the connection is closed.
    ///
    /// Frames that do not decode as server messages are skipped.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        if let Some(message) = self.backlog.pop_front() {
            return Some(message);
        }
        loop {
            let frame = self.channel.recv().await?;
            match ServerMessage::from_message(&frame) {
                Ok(message) => return Some(message),
                Err(e) => tracing::warn!("Ignoring unreadable server message: {}", e),
            }
        }
    }

    /// Create a room and return its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the server rejects the request, the connection
    /// closes, or no reply arrives in time.
    pub async fn create_room(&mut self) -> Result<RoomId> {
        self.send(&ClientMessage::CreateRoom)?;
        self.await_reply(|message| match message {
            ServerMessage::RoomCreated { room_id } => Some(Ok(room_id.clone())),
            ServerMessage::Error { message } => Some(Err(Error::ProtocolError(message.clone()))),
            _ => None,
        })
        .await
    }

    /// Join a room as a receiver.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RoomNotFound`] if the room has no sender, or an error
    /// if the connection closes or no reply arrives in time.
    pub async fn join_room(&mut self, room_id: &RoomId) -> Result<()> {
        self.send(&ClientMessage::JoinRoom {
            room_id: room_id.to_string(),
        })?;
        self.await_reply(|message| match message {
            ServerMessage::RoomJoined { room_id: joined } if joined == room_id => Some(Ok(())),
            ServerMessage::NoSender { .. } => Some(Err(Error::RoomNotFound(room_id.to_string()))),
            ServerMessage::Error { message } => Some(Err(Error::ProtocolError(message.clone()))),
            _ => None,
        })
        .await
    }

    /// Relay an opaque payload to another peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn relay(&self, to: &PeerId, payload: serde_json::Value) -> Result<()> {
        self.send(&ClientMessage::RelaySetup {
            to: Some(to.clone()),
            payload: Some(payload),
        })
    }

    /// Leave the current room, keeping the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn leave(&self) -> Result<()> {
        self.send(&ClientMessage::PeerDisconnect)
    }

    /// Close the connection.
    pub fn close(&self) {
        self.channel.close();
    }

    async fn await_reply<T, F>(&mut self, mut matcher: F) -> Result<T>
    where
        F: FnMut(&ServerMessage) -> Option<Result<T>>,
    {
        let channel = &self.channel;
        let mut skipped = Vec::new();
        let wait = async {
            loop {
                let Some(frame) = channel.recv().await else {
                    return Err(Error::ChannelClosed);
                };
                let message = match ServerMessage::from_message(&frame) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!("Ignoring unreadable server message: {}", e);
                        continue;
                    }
                };
                if let Some(result) = matcher(&message) {
                    return result;
                }
                skipped.push(message);
            }
        };

        let result = tokio::time::timeout(REPLY_TIMEOUT, wait)
            .await
            .unwrap_or(Err(Error::Timeout(REPLY_TIMEOUT.as_secs())));
        self.backlog.extend(skipped);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SignalingServer;

    #[tokio::test]
    async fn test_create_and_join() {
        let server = SignalingServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        tokio::spawn(server.run());

        let mut sender = SignalingClient::connect(addr).await.unwrap();
        let room = sender.create_room().await.unwrap();

        let mut receiver = SignalingClient::connect(addr).await.unwrap();
        receiver.join_room(&room).await.unwrap();

        let Some(ServerMessage::Init { peer_id }) = sender.recv().await else {
            panic!("expected init");
        };
        assert!(matches!(sender.recv().await, Some(ServerMessage::PeerJoined { .. })));
        assert_eq!(
            sender.recv().await,
            Some(ServerMessage::MembershipChanged { count: 1 })
        );

        sender
            .relay(&peer_id, serde_json::json!({"addr": "127.0.0.1:1"}))
            .unwrap();
        assert!(matches!(
            receiver.recv().await,
            Some(ServerMessage::RelaySetup { .. })
        ));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_join_missing_room() {
        let server = SignalingServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        tokio::spawn(server.run());

        let mut receiver = SignalingClient::connect(addr).await.unwrap();
        let room = RoomId::parse("123456").unwrap();
        let result = receiver.join_room(&room).await;
        assert!(matches!(result, Err(Error::RoomNotFound(id)) if id == "123456"));

        handle.shutdown();
    }
}

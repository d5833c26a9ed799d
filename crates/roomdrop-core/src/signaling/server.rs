//! Rendezvous server.
//!
//! Each accepted connection is registered with the [`Directory`] and served
//! by one task that forwards client requests to the directory and the
//! peer's mailbox back to the socket. When the socket closes the peer is
//! disconnected, which cascades exactly like an explicit leave.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::broadcast;

use super::message::{ClientMessage, ServerMessage};
use crate::channel::{Channel, TcpChannel};
use crate::directory::{Directory, PeerId};
use crate::error::{Error, Result};
use crate::protocol::Message;
use crate::room::RoomId;

/// Stops a running [`SignalingServer`] and all its connections.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    shutdown_tx: broadcast::Sender<()>,
}

impl ServerHandle {
    /// Signal the server to stop accepting and close every connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// TCP rendezvous server.
#[derive(Debug)]
pub struct SignalingServer {
    listener: TcpListener,
    directory: Directory,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl SignalingServer {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        Ok(Self {
            listener,
            directory: Directory::new(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Address the server is listening on.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The directory backing this server.
    #[must_use]
    pub fn directory(&self) -> Directory {
        self.directory.clone()
    }

    /// A handle that can stop the server from another task.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Accept connections until shut down.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; accept failures are logged and the
    /// loop continues.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(
            "Rendezvous server listening on {}",
            self.listener.local_addr()?
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let directory = self.directory.clone();
                        let shutdown_rx = self.shutdown_tx.subscribe();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, directory, shutdown_rx).await {
                                tracing::warn!("Connection from {} failed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                    }
                },
                _ = self.shutdown_rx.recv() => {
                    tracing::info!("Rendezvous server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    directory: Directory,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let channel = TcpChannel::from_stream(stream)?;
    let (peer, mut mailbox) = directory.register().await;
    tracing::debug!("Peer {} connected from {}", peer, channel.peer_addr());

    loop {
        tokio::select! {
            inbound = channel.recv() => match inbound {
                Some(message) => handle_message(&directory, &peer, &message).await,
                None => break,
            },
            Some(outbound) = mailbox.recv() => {
                let sent = outbound
                    .to_message()
                    .and_then(|message| channel.send(message));
                if let Err(e) = sent {
                    tracing::debug!("Dropping {} for {}: {}", outbound.type_name(), peer, e);
                    break;
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    directory.disconnect(&peer).await;
    channel.close();
    Ok(())
}

async fn handle_message(directory: &Directory, peer: &PeerId, message: &Message) {
    let request = match ClientMessage::from_message(message) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!("Malformed message from {}: {}", peer, e);
            reply_error(directory, peer, format!("malformed control message: {e}")).await;
            return;
        }
    };

    match request {
        ClientMessage::CreateRoom => {
            if let Err(e) = directory.create_room(peer).await {
                reply_error(directory, peer, e.to_string()).await;
            }
        }
        ClientMessage::JoinRoom { room_id } => {
            let joined = match RoomId::parse(&room_id) {
                Ok(id) => directory.join_room(&id, peer).await.map(|_| ()),
                Err(_) => Err(Error::RoomNotFound(room_id.clone())),
            };
            match joined {
                Ok(()) => {}
                Err(Error::RoomNotFound(_)) => {
                    directory
                        .send_to(
                            peer,
                            ServerMessage::NoSender {
                                message: format!("No sender found for room {room_id}"),
                            },
                        )
                        .await;
                }
                Err(e) => reply_error(directory, peer, e.to_string()).await,
            }
        }
        ClientMessage::RelaySetup {
            to: Some(to),
            payload: Some(payload),
        } => directory.relay(peer, &to, payload).await,
        ClientMessage::RelaySetup { .. } => {
            tracing::debug!("Relay from {} without recipient or payload dropped", peer);
        }
        ClientMessage::PeerDisconnect => directory.leave(peer).await,
    }
}

async fn reply_error(directory: &Directory, peer: &PeerId, message: String) {
    directory
        .send_to(peer, ServerMessage::Error { message })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn start() -> (SocketAddr, ServerHandle, Directory) {
        let server = SignalingServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        let directory = server.directory();
        tokio::spawn(server.run());
        (addr, handle, directory)
    }

    async fn next(channel: &TcpChannel) -> ServerMessage {
        let message = tokio::time::timeout(Duration::from_secs(2), channel.recv())
            .await
            .expect("reply in time")
            .expect("connection open");
        ServerMessage::from_message(&message).unwrap()
    }

    #[tokio::test]
    async fn test_malformed_message_keeps_connection() {
        let (addr, handle, _) = start().await;
        let channel = TcpChannel::connect(addr).await.unwrap();

        channel.send(Message::Text("{not json".to_string())).unwrap();
        assert!(matches!(next(&channel).await, ServerMessage::Error { .. }));

        channel
            .send(ClientMessage::CreateRoom.to_message().unwrap())
            .unwrap();
        assert!(matches!(next(&channel).await, ServerMessage::RoomCreated { .. }));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_room_id_is_no_sender() {
        let (addr, handle, _) = start().await;
        let channel = TcpChannel::connect(addr).await.unwrap();

        let join = ClientMessage::JoinRoom {
            room_id: "abc".to_string(),
        };
        channel.send(join.to_message().unwrap()).unwrap();
        assert!(matches!(next(&channel).await, ServerMessage::NoSender { .. }));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_socket_close_disconnects_peer() {
        let (addr, handle, directory) = start().await;
        let channel = TcpChannel::connect(addr).await.unwrap();
        channel
            .send(ClientMessage::CreateRoom.to_message().unwrap())
            .unwrap();
        next(&channel).await;
        assert_eq!(directory.room_count().await, 1);

        channel.close();
        drop(channel);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while directory.room_count().await > 0 {
            assert!(tokio::time::Instant::now() < deadline, "room not torn down");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(directory.peer_count().await, 0);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (addr, handle, _) = start().await;
        let channel = TcpChannel::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(2), channel.closed())
            .await
            .expect("connection closed on shutdown");
    }
}

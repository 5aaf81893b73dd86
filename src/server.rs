//! WebSocket front door for the authority.
//!
//! ```text
//! peer A ──┐
//!           ├── ClientMessage ──► Authority ── GroupSession ── UpdateLog
//! peer B ──┘                          │
//!                              ┌──────┴──────┐
//!                              ▼             ▼
//!                           peer A         peer B   (UpdateBroadcast)
//! ```
//!
//! One task per connection: a `select!` over the socket and the
//! connection's broadcast receiver, so pushes flow in and accepted
//! updates flow out on the same persistent channel. The connection owns
//! its membership; dropping it deregisters the participant.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::algebra::ChangeAlgebra;
use crate::authority::{Authority, AuthorityConfig};
use crate::broadcast::Accepted;
use crate::protocol::{ClientMessage, ServerMessage, SyncError, WireUpdate};
use crate::update::Update;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Maximum participants per group.
    pub max_peers_per_group: usize,
    /// Broadcast channel capacity per group.
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9180".to_string(),
            max_peers_per_group: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_groups: usize,
}

/// The sync server: accepts WebSocket connections and drives the
/// authority on behalf of remote peers.
pub struct SyncServer<A: ChangeAlgebra> {
    config: ServerConfig,
    authority: Arc<Authority<A>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl<A: ChangeAlgebra> SyncServer<A> {
    /// Create a server around a fresh authority for the given algebra.
    pub fn new(algebra: A, config: ServerConfig) -> Self {
        let authority = Authority::with_config(
            algebra,
            AuthorityConfig {
                broadcast_capacity: config.broadcast_capacity,
                max_peers_per_group: config.max_peers_per_group,
            },
        );
        Self {
            config,
            authority: Arc::new(authority),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults(algebra: A) -> Self {
        Self::new(algebra, ServerConfig::default())
    }

    /// The authority, for peers colocated with the server process.
    pub fn authority(&self) -> &Arc<Authority<A>> {
        &self.authority
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_groups = self.authority.group_count().await;
        stats
    }

    /// Listen for connections. Runs the accept loop forever; call from
    /// an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let authority = self.authority.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, authority, stats.clone()).await
                {
                    log::error!("connection error from {addr}: {e}");
                }
                let mut s = stats.write().await;
                s.active_connections = s.active_connections.saturating_sub(1);
            });
        }
    }

    /// Drive one WebSocket connection until it closes.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        authority: Arc<Authority<A>>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Set once the peer creates or joins a group.
        let mut membership: Option<(String, String)> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Accepted<A::Change>>> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            match ClientMessage::decode(&bytes) {
                                Ok(message) => {
                                    if let Some(reply) = Self::handle_message(
                                        message,
                                        addr,
                                        &authority,
                                        &mut membership,
                                        &mut broadcast_rx,
                                    )
                                    .await?
                                    {
                                        ws_sender
                                            .send(Message::Binary(reply.encode()?.into()))
                                            .await?;
                                    }
                                }
                                Err(e) => {
                                    log::warn!("failed to decode message from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                accepted = async {
                    if let Some(ref mut rx) = broadcast_rx {
                        rx.recv().await
                    } else {
                        // Not in a group yet — wait forever.
                        std::future::pending().await
                    }
                } => {
                    match accepted {
                        Ok(accepted) => {
                            if let Some((group_id, _)) = &membership {
                                let msg = ServerMessage::UpdateBroadcast {
                                    group_id: group_id.clone(),
                                    version: accepted.version,
                                    update: WireUpdate::encode(accepted.update.as_ref())?,
                                };
                                ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("connection {addr} lagged by {n} broadcast(s)");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        if let Some((group_id, tag)) = membership {
            let _ = authority.leave(&group_id, &tag).await;
        }
        Ok(())
    }

    /// Apply one decoded client message; the optional reply goes back on
    /// the same socket.
    async fn handle_message(
        message: ClientMessage,
        addr: SocketAddr,
        authority: &Arc<Authority<A>>,
        membership: &mut Option<(String, String)>,
        broadcast_rx: &mut Option<broadcast::Receiver<Accepted<A::Change>>>,
    ) -> Result<Option<ServerMessage>, SyncError> {
        match message {
            ClientMessage::CreateGroup => {
                // A connection serves one group; a second create or join
                // replaces the old membership.
                if let Some((old_group, old_tag)) = membership.take() {
                    let _ = authority.leave(&old_group, &old_tag).await;
                }
                let grant = authority.create_group().await;
                log::info!(
                    "peer {addr} created group {} as participant {}",
                    grant.group_id,
                    grant.presence_tag
                );
                *membership = Some((grant.group_id.clone(), grant.presence_tag.clone()));
                *broadcast_rx = Some(grant.updates);
                Ok(Some(ServerMessage::DocumentRequested {
                    group_id: grant.group_id,
                    version: grant.version,
                    document: grant.document,
                    presence_tag: grant.presence_tag,
                }))
            }

            ClientMessage::RequestDocument { group_id } => {
                if let Some((old_group, old_tag)) = membership.take() {
                    let _ = authority.leave(&old_group, &old_tag).await;
                }
                match authority.join(&group_id).await {
                    Ok(grant) => {
                        log::info!(
                            "peer {addr} joined group {group_id} as participant {} at version {}",
                            grant.presence_tag,
                            grant.version
                        );
                        *membership = Some((grant.group_id.clone(), grant.presence_tag.clone()));
                        *broadcast_rx = Some(grant.updates);
                        Ok(Some(ServerMessage::DocumentRequested {
                            group_id: grant.group_id,
                            version: grant.version,
                            document: grant.document,
                            presence_tag: grant.presence_tag,
                        }))
                    }
                    Err(e) => {
                        log::warn!("join from {addr} rejected: {e}");
                        Ok(Some(ServerMessage::Rejected {
                            reason: e.to_string(),
                        }))
                    }
                }
            }

            ClientMessage::PushUpdates {
                group_id,
                base_version,
                updates,
            } => {
                let mut decoded: Vec<Update<A::Change>> = Vec::with_capacity(updates.len());
                for wire_update in updates {
                    match wire_update.decode() {
                        Ok(update) => decoded.push(update),
                        Err(e) => {
                            log::warn!("push from {addr} undecodable: {e}");
                            return Ok(Some(ServerMessage::Rejected {
                                reason: e.to_string(),
                            }));
                        }
                    }
                }
                match authority.push(&group_id, base_version, decoded).await {
                    Ok(versions) => {
                        log::debug!(
                            "accepted {} update(s) from {addr} for group {group_id}",
                            versions.len()
                        );
                        Ok(None)
                    }
                    Err(e) => {
                        log::warn!("push from {addr} rejected: {e}");
                        Ok(Some(ServerMessage::Rejected {
                            reason: e.to_string(),
                        }))
                    }
                }
            }
        }
    }
}

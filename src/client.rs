//! WebSocket client: a remote peer's end of the channel.
//!
//! The handle is explicitly constructed by whichever scope opens a
//! document and dies with it — there is no process-wide shared
//! connection. One connection serves one group: create or join, then
//! hand the [`RemoteGroup`]'s pusher and broadcast receiver to a
//! [`crate::peer::PeerAgent`].
//!
//! Transport loss never discards local edits: pending updates stay with
//! the peer state, and a fresh `join` against the same group resumes
//! from the last synced version (the authority's log is append-only, so
//! any base version remains rebasable).

use std::marker::PhantomData;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::algebra::ChangeAlgebra;
use crate::broadcast::Accepted;
use crate::peer::{PeerState, PushLink};
use crate::protocol::{ClientMessage, ServerMessage, SyncError, WireUpdate};
use crate::update::Update;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Out-of-band notifications from the connection.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The authority rejected a call; resynchronize by rejoining.
    Rejected(String),
    /// The transport dropped.
    Disconnected,
}

/// A live connection to one collaboration group.
#[derive(Debug)]
pub struct RemoteGroup<C> {
    group_id: String,
    presence_tag: String,
    version: u64,
    document: String,
    out_tx: mpsc::Sender<Vec<u8>>,
    updates: broadcast::Sender<Accepted<C>>,
    /// Receiver subscribed before the reader task starts, so no
    /// broadcast can slip past between joining and subscribing.
    first_updates: Option<broadcast::Receiver<Accepted<C>>>,
    events: broadcast::Sender<ClientEvent>,
    state: Arc<RwLock<ConnectionState>>,
}

impl<C> RemoteGroup<C>
where
    C: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Connect and establish a fresh group; the caller becomes its first
    /// participant.
    pub async fn create(url: &str) -> Result<Self, SyncError> {
        Self::connect(url, None).await
    }

    /// Connect and join an existing group.
    pub async fn join(url: &str, group_id: &str) -> Result<Self, SyncError> {
        Self::connect(url, Some(group_id.to_string())).await
    }

    async fn connect(url: &str, group: Option<String>) -> Result<Self, SyncError> {
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));

        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|_| SyncError::ConnectionClosed)?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
        });

        let request = match group {
            None => ClientMessage::CreateGroup,
            Some(group_id) => ClientMessage::RequestDocument { group_id },
        };
        out_tx
            .send(request.encode()?)
            .await
            .map_err(|_| SyncError::ConnectionClosed)?;

        // Read inline until the authority answers the handshake.
        let (group_id, version, document, presence_tag) = loop {
            match ws_reader.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    match ServerMessage::decode(&bytes)? {
                        ServerMessage::DocumentRequested {
                            group_id,
                            version,
                            document,
                            presence_tag,
                        } => break (group_id, version, document, presence_tag),
                        ServerMessage::Rejected { reason } => {
                            return Err(SyncError::ProtocolViolation(reason));
                        }
                        other => {
                            log::debug!("ignoring pre-join message: {other:?}");
                        }
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return Err(SyncError::ConnectionClosed),
            }
        };

        *state.write().await = ConnectionState::Connected;
        log::info!("joined group {group_id} as participant {presence_tag} at version {version}");

        let (updates_tx, first_updates) = broadcast::channel(256);
        let (events_tx, _) = broadcast::channel(16);

        // Reader task: decode broadcasts for our group and publish them.
        let reader_updates = updates_tx.clone();
        let reader_events = events_tx.clone();
        let reader_state = state.clone();
        let our_group = group_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match ServerMessage::decode(&bytes) {
                            Ok(ServerMessage::UpdateBroadcast {
                                group_id,
                                version,
                                update,
                            }) => {
                                if group_id != our_group {
                                    log::debug!("ignoring broadcast for group {group_id}");
                                    continue;
                                }
                                match update.decode::<C>() {
                                    Ok(update) => {
                                        let _ = reader_updates.send(Accepted {
                                            version,
                                            update: Arc::new(Update {
                                                version: Some(version),
                                                ..update
                                            }),
                                        });
                                    }
                                    Err(e) => {
                                        log::warn!("undecodable broadcast {version}: {e}");
                                    }
                                }
                            }
                            Ok(ServerMessage::Rejected { reason }) => {
                                log::warn!("authority rejected a call: {reason}");
                                let _ = reader_events.send(ClientEvent::Rejected(reason));
                            }
                            Ok(other) => {
                                log::debug!("ignoring message: {other:?}");
                            }
                            Err(e) => {
                                log::warn!("failed to decode server message: {e}");
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *reader_state.write().await = ConnectionState::Disconnected;
            let _ = reader_events.send(ClientEvent::Disconnected);
        });

        Ok(Self {
            group_id,
            presence_tag,
            version,
            document,
            out_tx,
            updates: updates_tx,
            first_updates: Some(first_updates),
            events: events_tx,
            state,
        })
    }

    /// The group identifier — also the value to embed in an invite link.
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn presence_tag(&self) -> &str {
        &self.presence_tag
    }

    /// Log length at join time; the first broadcast to apply is
    /// `version() + 1`.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Document snapshot at join time.
    pub fn document(&self) -> &str {
        &self.document
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// The receiver held open since the handshake — hand this to the
    /// peer agent. Can only be taken once.
    pub fn take_updates(&mut self) -> Option<broadcast::Receiver<Accepted<C>>> {
        self.first_updates.take()
    }

    /// Subscribe to this group's accepted updates from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Accepted<C>> {
        self.updates.subscribe()
    }

    /// Subscribe to connection events (rejections, disconnect).
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// The push half of the link, for a [`crate::peer::PeerAgent`].
    pub fn pusher(&self) -> RemotePush<C> {
        RemotePush {
            group_id: self.group_id.clone(),
            out_tx: self.out_tx.clone(),
            _change: PhantomData,
        }
    }

    /// Seed a peer state from the join snapshot.
    pub fn peer_state<A>(&self, algebra: Arc<A>) -> PeerState<A>
    where
        A: ChangeAlgebra<Change = C>,
    {
        PeerState::new(
            algebra,
            self.presence_tag.clone(),
            self.version,
            self.document.clone(),
        )
    }
}

/// Pushes updates over the WebSocket connection.
///
/// Completion means the push was handed to the transport; acceptance
/// shows up as the update coming back on the broadcast stream.
pub struct RemotePush<C> {
    group_id: String,
    out_tx: mpsc::Sender<Vec<u8>>,
    _change: PhantomData<fn() -> C>,
}

impl<C> Clone for RemotePush<C> {
    fn clone(&self) -> Self {
        Self {
            group_id: self.group_id.clone(),
            out_tx: self.out_tx.clone(),
            _change: PhantomData,
        }
    }
}

impl<C> PushLink<C> for RemotePush<C>
where
    C: Clone + Serialize + Send + Sync + 'static,
{
    async fn push(&self, base_version: u64, updates: Vec<Update<C>>) -> Result<(), SyncError> {
        let wire: Vec<WireUpdate> = updates
            .iter()
            .map(WireUpdate::encode)
            .collect::<Result<_, _>>()?;
        let msg = ClientMessage::PushUpdates {
            group_id: self.group_id.clone(),
            base_version,
            updates: wire,
        };
        self.out_tx
            .send(msg.encode()?)
            .await
            .map_err(|_| SyncError::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{splice, Splice};

    #[tokio::test]
    async fn test_push_on_dead_connection_fails() {
        let (out_tx, out_rx) = mpsc::channel(1);
        drop(out_rx);
        let push = RemotePush::<Splice> {
            group_id: "g".into(),
            out_tx,
            _change: PhantomData,
        };

        let err = push
            .push(0, vec![Update::edit("p", splice(0, 0, "x"), vec![])])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ConnectionClosed));
    }

    #[test]
    fn test_connection_state_values() {
        assert_ne!(ConnectionState::Disconnected, ConnectionState::Connected);
        assert_ne!(ConnectionState::Connecting, ConnectionState::Connected);
    }
}

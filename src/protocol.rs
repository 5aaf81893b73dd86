//! Binary wire protocol between peers and the authority.
//!
//! Wire format (bincode-encoded envelopes):
//! ```text
//! peer ──► authority   CreateGroup | RequestDocument | PushUpdates
//! authority ──► peer   DocumentRequested | UpdateBroadcast | Rejected
//! ```
//!
//! An update travels as a transport-neutral record: originator string, an
//! opaque serialized change (absent for pure-effect updates), and a list
//! of tagged effect payloads. Unknown effect kinds are dropped on decode
//! so future protocol extensions never break older peers.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::update::{Effect, Update};

/// Effect kind tags on the wire.
const EFFECT_PRESENCE: u8 = 1;
const EFFECT_TITLE: u8 = 2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct PresencePayload {
    tag: String,
    positions: Vec<usize>,
}

/// A tagged, serialized effect.
///
/// The payload stays opaque until the kind is recognized, which is what
/// makes unknown kinds skippable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEffect {
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl WireEffect {
    fn encode(effect: &Effect) -> Result<Self, SyncError> {
        match effect {
            Effect::Presence { tag, positions } => Ok(Self {
                kind: EFFECT_PRESENCE,
                payload: to_bytes(&PresencePayload {
                    tag: tag.clone(),
                    positions: positions.clone(),
                })?,
            }),
            Effect::Title { value } => Ok(Self {
                kind: EFFECT_TITLE,
                payload: to_bytes(value)?,
            }),
        }
    }

    /// Decode a recognized effect; `None` for unknown kinds.
    fn decode(self) -> Result<Option<Effect>, SyncError> {
        match self.kind {
            EFFECT_PRESENCE => {
                let payload: PresencePayload = from_bytes(&self.payload)?;
                Ok(Some(Effect::Presence {
                    tag: payload.tag,
                    positions: payload.positions,
                }))
            }
            EFFECT_TITLE => Ok(Some(Effect::Title {
                value: from_bytes(&self.payload)?,
            })),
            _ => Ok(None),
        }
    }
}

/// Transport-neutral record of one update.
///
/// The assigned version does not travel here — it rides next to the
/// update in [`ServerMessage::UpdateBroadcast`], since only the authority
/// ever assigns one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireUpdate {
    pub originator: String,
    pub changes: Option<Vec<u8>>,
    pub effects: Vec<WireEffect>,
}

impl WireUpdate {
    /// Serialize a typed update for transport.
    pub fn encode<C: Serialize>(update: &Update<C>) -> Result<Self, SyncError> {
        let changes = match &update.changes {
            Some(c) => Some(to_bytes(c)?),
            None => None,
        };
        let effects = update
            .effects
            .iter()
            .map(WireEffect::encode)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            originator: update.originator.clone(),
            changes,
            effects,
        })
    }

    /// Reconstruct the typed update. Unknown effect kinds are dropped.
    pub fn decode<C: DeserializeOwned>(self) -> Result<Update<C>, SyncError> {
        let changes = match self.changes {
            Some(bytes) => Some(from_bytes(&bytes)?),
            None => None,
        };
        let mut effects = Vec::with_capacity(self.effects.len());
        for wire_effect in self.effects {
            if let Some(effect) = wire_effect.decode()? {
                effects.push(effect);
            }
        }
        Ok(Update {
            originator: self.originator,
            changes,
            effects,
            version: None,
        })
    }
}

/// Messages a peer sends to the authority.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ClientMessage {
    /// Establish a fresh group; the caller becomes its first participant.
    CreateGroup,
    /// Join an existing group.
    RequestDocument { group_id: String },
    /// Submit locally authored updates computed against `base_version`.
    PushUpdates {
        group_id: String,
        base_version: u64,
        updates: Vec<WireUpdate>,
    },
}

/// Messages the authority sends to a peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ServerMessage {
    /// Join (or create) response: the snapshot to synchronize from.
    DocumentRequested {
        group_id: String,
        version: u64,
        document: String,
        presence_tag: String,
    },
    /// Fan-out of one accepted update, sent to every participant
    /// including the originator.
    UpdateBroadcast {
        group_id: String,
        version: u64,
        update: WireUpdate,
    },
    /// A call failed; the caller can resynchronize by rejoining.
    Rejected { reason: String },
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        to_bytes(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        from_bytes(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        to_bytes(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        from_bytes(bytes)
    }
}

fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, SyncError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| SyncError::SerializationError(e.to_string()))
}

fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SyncError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| SyncError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// Malformed base version or unknown group. Fatal for the call, never
    /// for the log.
    ProtocolViolation(String),
    /// The change algebra failed during rebase or apply; the push is
    /// dropped, the pusher's pending state keeps the updates.
    IrreconcilableEdit(String),
    SerializationError(String),
    DeserializationError(String),
    /// The transport dropped mid-call. Recovered by the push loop's retry
    /// and the pull loop's rejoin-and-resume.
    ConnectionClosed,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProtocolViolation(e) => write!(f, "protocol violation: {e}"),
            Self::IrreconcilableEdit(e) => write!(f, "irreconcilable edit: {e}"),
            Self::SerializationError(e) => write!(f, "serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for SyncError {}

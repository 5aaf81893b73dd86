//! Per-group fan-out of accepted updates.
//!
//! Built on a tokio broadcast channel: every participant (the originator
//! included) holds an independent receiver, so one send reaches all of
//! them and relative order is preserved per receiver. A receiver that
//! falls more than `capacity` messages behind observes `Lagged` and must
//! resynchronize by rejoining.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::update::Update;

/// One accepted update together with its assigned version, as fanned out
/// to every participant.
#[derive(Debug)]
pub struct Accepted<C> {
    pub version: u64,
    pub update: Arc<Update<C>>,
}

impl<C> Clone for Accepted<C> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            update: self.update.clone(),
        }
    }
}

/// Fan-out statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub updates_sent: u64,
    pub participants: usize,
}

/// The broadcast side of one group session.
///
/// Owned by the authority's per-group session (which already serializes
/// access), so the participant registry needs no lock of its own. The
/// sent counter is atomic so stats snapshots never contend with sends.
pub struct GroupChannel<C> {
    sender: broadcast::Sender<Accepted<C>>,
    participants: HashSet<String>,
    capacity: usize,
    updates_sent: AtomicU64,
}

impl<C: Clone> GroupChannel<C> {
    /// `capacity` is how many accepted updates a slow receiver may buffer
    /// before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            participants: HashSet::new(),
            capacity,
            updates_sent: AtomicU64::new(0),
        }
    }

    /// Register a participant tag and hand back its receiver.
    pub fn register(&mut self, tag: impl Into<String>) -> broadcast::Receiver<Accepted<C>> {
        self.participants.insert(tag.into());
        self.sender.subscribe()
    }

    /// Remove a participant tag. Its receiver dies when dropped.
    pub fn unregister(&mut self, tag: &str) -> bool {
        self.participants.remove(tag)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn participant_tags(&self) -> Vec<String> {
        self.participants.iter().cloned().collect()
    }

    pub fn has_participant(&self, tag: &str) -> bool {
        self.participants.contains(tag)
    }

    /// Fan one accepted update out to every registered receiver.
    ///
    /// Returns the number of receivers reached; zero when everyone has
    /// already disconnected.
    pub fn broadcast(&self, accepted: Accepted<C>) -> usize {
        let reached = self.sender.send(accepted).unwrap_or(0);
        self.updates_sent.fetch_add(1, Ordering::Relaxed);
        reached
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            updates_sent: self.updates_sent.load(Ordering::Relaxed),
            participants: self.participants.len(),
        }
    }
}

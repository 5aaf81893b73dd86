//! Presence: cursor markers and the shared title.
//!
//! Presence rides inside updates on the same ordered channel as document
//! edits, so it can never refer to text the receiver has not seen yet.
//! This module is the peer-local bookkeeping: the peer's own cursor, the
//! last known cursor offsets per remote tag (last write wins, no
//! history), and the shared document title.
//!
//! All state is owned by the peer sync agent and mutated only through
//! the operations here — nothing reaches into it from outside.

use std::collections::HashMap;

use crate::algebra::ChangeAlgebra;
use crate::update::Effect;

/// One rendered cursor marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceMarker {
    pub tag: String,
    pub positions: Vec<usize>,
    /// Whether this marker belongs to the local participant, so a UI can
    /// style it differently.
    pub is_self: bool,
}

/// Presence state for one open document.
#[derive(Debug)]
pub struct PresenceState {
    own_tag: String,
    local_positions: Vec<usize>,
    remote: HashMap<String, Vec<usize>>,
    title: Option<String>,
}

impl PresenceState {
    pub fn new(own_tag: impl Into<String>) -> Self {
        Self {
            own_tag: own_tag.into(),
            local_positions: Vec::new(),
            remote: HashMap::new(),
            title: None,
        }
    }

    pub fn own_tag(&self) -> &str {
        &self.own_tag
    }

    /// Record the local cursor offsets (from the editing surface).
    pub fn set_local(&mut self, positions: Vec<usize>) {
        self.local_positions = positions;
    }

    pub fn local(&self) -> &[usize] {
        &self.local_positions
    }

    /// The local participant's cursor as an outgoing effect.
    pub fn local_effect(&self) -> Effect {
        Effect::Presence {
            tag: self.own_tag.clone(),
            positions: self.local_positions.clone(),
        }
    }

    /// Record the shared title locally (it still travels as an effect).
    pub fn set_title(&mut self, value: impl Into<String>) {
        self.title = Some(value.into());
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Merge one incoming effect. Presence replaces that tag's previous
    /// entry; Title replaces the shared title.
    pub fn merge_effect(&mut self, effect: &Effect) {
        match effect {
            Effect::Presence { tag, positions } => {
                if *tag != self.own_tag {
                    self.remote.insert(tag.clone(), positions.clone());
                }
            }
            Effect::Title { value } => {
                self.title = Some(value.clone());
            }
        }
    }

    /// Forget a departed participant's marker.
    pub fn forget(&mut self, tag: &str) -> bool {
        self.remote.remove(tag).is_some()
    }

    /// Translate every remote marker across an applied change.
    pub fn remap_remote<A: ChangeAlgebra>(&mut self, algebra: &A, change: &A::Change) {
        for positions in self.remote.values_mut() {
            for pos in positions.iter_mut() {
                *pos = algebra.map_position(*pos, change);
            }
        }
    }

    /// Translate the local cursor across an applied foreign change.
    pub fn remap_local<A: ChangeAlgebra>(&mut self, algebra: &A, change: &A::Change) {
        for pos in self.local_positions.iter_mut() {
            *pos = algebra.map_position(*pos, change);
        }
    }

    /// Number of participants this peer currently knows about.
    pub fn participant_count(&self) -> usize {
        self.remote.len() + 1
    }

    /// Markers to render, sorted by tag.
    ///
    /// Empty until at least one other tag is known, so a lone editor
    /// never sees a tooltip for itself.
    pub fn markers(&self) -> Vec<PresenceMarker> {
        if self.remote.is_empty() {
            return Vec::new();
        }
        let mut markers: Vec<PresenceMarker> = self
            .remote
            .iter()
            .map(|(tag, positions)| PresenceMarker {
                tag: tag.clone(),
                positions: positions.clone(),
                is_self: false,
            })
            .collect();
        markers.push(PresenceMarker {
            tag: self.own_tag.clone(),
            positions: self.local_positions.clone(),
            is_self: true,
        });
        markers.sort_by(|a, b| a.tag.cmp(&b.tag));
        markers
    }
}

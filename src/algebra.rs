//! Seam to the external change algebra.
//!
//! The protocol never computes how one edit composes with or rebases
//! against another — that math belongs to whatever edit representation
//! the embedding editor uses (an OT change set, a CRDT delta, a diff
//! library). This module defines the three primitives the protocol
//! consumes and nothing else:
//!
//! ```text
//! apply(doc, change)          ──► doc'
//! rebase(pending, against)    ──► pending'   (re-anchor stale edits)
//! map_position(pos, change)   ──► pos'       (cursor tracking)
//! ```
//!
//! Implementations are supplied by the caller; the test suite carries a
//! minimal splice-based one.

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

/// Failure inside the change algebra (malformed change, impossible
/// rebase). Never expected with a correct algebra and well-formed input;
/// the authority treats it as fatal for the offending push.
#[derive(Debug, Clone)]
pub struct AlgebraError(String);

impl AlgebraError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for AlgebraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "change algebra error: {}", self.0)
    }
}

impl std::error::Error for AlgebraError {}

/// The edit representation and the operations the protocol needs on it.
///
/// `Change` must be serializable so the wire codec can carry it as an
/// opaque payload, and comparable so tests can assert round-trips.
pub trait ChangeAlgebra: Send + Sync + 'static {
    /// One span-based edit against a known document state.
    type Change: Clone
        + fmt::Debug
        + PartialEq
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    /// Apply a change to a document snapshot, producing the new snapshot.
    fn apply(&self, doc: &str, change: &Self::Change) -> Result<String, AlgebraError>;

    /// Re-derive `pending` (a sequence of changes, each made on top of the
    /// previous) so it applies cleanly after `against` (changes the pending
    /// sequence did not account for). Order within both sequences is
    /// significant.
    fn rebase(
        &self,
        pending: &[Self::Change],
        against: &[Self::Change],
    ) -> Result<Vec<Self::Change>, AlgebraError>;

    /// Translate a text offset across a change.
    fn map_position(&self, pos: usize, change: &Self::Change) -> usize;
}

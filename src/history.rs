//! Append-only update log: the single source of truth for one group.
//!
//! The version of an update is its 1-based index at acceptance time.
//! Versions are assigned here and only here; the log is never rewritten.
//! Folding the log over the initial document deterministically reproduces
//! the authoritative text — the authority keeps a materialized snapshot,
//! and [`UpdateLog::fold`] lets tests check the two never diverge.

use std::sync::Arc;

use crate::algebra::{AlgebraError, ChangeAlgebra};
use crate::update::Update;

/// Ordered sequence of accepted updates for one collaboration group.
#[derive(Debug)]
pub struct UpdateLog<C> {
    entries: Vec<Arc<Update<C>>>,
}

impl<C> UpdateLog<C> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Current length, which is also the latest assigned version.
    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an accepted update, assigning it the next version.
    ///
    /// Returns the assigned version and the stored (stamped) update.
    pub fn append(&mut self, update: Update<C>) -> (u64, Arc<Update<C>>) {
        let version = self.entries.len() as u64 + 1;
        let stored = Arc::new(Update {
            version: Some(version),
            ..update
        });
        self.entries.push(stored.clone());
        (version, stored)
    }

    /// The accepted updates past `base_version` — what a stale push must
    /// be rebased against.
    pub fn slice_from(&self, base_version: u64) -> &[Arc<Update<C>>] {
        &self.entries[base_version as usize..]
    }

    /// The update accepted as `version`, if any.
    pub fn get(&self, version: u64) -> Option<&Arc<Update<C>>> {
        if version == 0 {
            return None;
        }
        self.entries.get(version as usize - 1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Update<C>>> {
        self.entries.iter()
    }
}

impl<C> UpdateLog<C> {
    /// Replay the whole log over an initial document.
    pub fn fold<A>(&self, algebra: &A, initial: &str) -> Result<String, AlgebraError>
    where
        A: ChangeAlgebra<Change = C>,
    {
        let mut doc = initial.to_string();
        for entry in &self.entries {
            if let Some(changes) = &entry.changes {
                doc = algebra.apply(&doc, changes)?;
            }
        }
        Ok(doc)
    }
}

impl<C> Default for UpdateLog<C> {
    fn default() -> Self {
        Self::new()
    }
}

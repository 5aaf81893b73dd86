//! Updates: the atomic unit of the sync protocol.
//!
//! An [`Update`] bundles one document change with any side-channel
//! [`Effect`]s (cursor presence, shared title) contributed by a single
//! peer. Updates are immutable once constructed; the authority stamps a
//! version onto its own accepted copy, never onto the peer's original.

use std::sync::Arc;

use crate::algebra::{AlgebraError, ChangeAlgebra};

/// Non-document metadata riding alongside a change.
///
/// A closed set: serialization and remapping sites match exhaustively, so
/// adding a kind is a compile-time-checked change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// One participant's cursor offsets, keyed by their presence tag.
    Presence { tag: String, positions: Vec<usize> },
    /// The shared document title. Carries no positional data.
    Title { value: String },
}

impl Effect {
    /// Translate positional data across a sequence of changes.
    ///
    /// `Title` passes through untouched.
    pub fn remapped<A: ChangeAlgebra>(&self, algebra: &A, changes: &[&A::Change]) -> Effect {
        match self {
            Effect::Presence { tag, positions } => Effect::Presence {
                tag: tag.clone(),
                positions: positions
                    .iter()
                    .map(|&pos| {
                        changes
                            .iter()
                            .fold(pos, |p, change| algebra.map_position(p, change))
                    })
                    .collect(),
            },
            Effect::Title { value } => Effect::Title {
                value: value.clone(),
            },
        }
    }
}

/// One atomic contribution to a collaboration group.
///
/// `changes` is `None` for pure-effect updates (cursor movement, title
/// edits) that touch no document text. `version` is `None` until the
/// authority accepts the update.
#[derive(Debug, Clone, PartialEq)]
pub struct Update<C> {
    pub originator: String,
    pub changes: Option<C>,
    pub effects: Vec<Effect>,
    pub version: Option<u64>,
}

impl<C> Update<C> {
    /// A document edit with accompanying effects.
    pub fn edit(originator: impl Into<String>, changes: C, effects: Vec<Effect>) -> Self {
        Self {
            originator: originator.into(),
            changes: Some(changes),
            effects,
            version: None,
        }
    }

    /// An update carrying only effects (no document change).
    pub fn effects_only(originator: impl Into<String>, effects: Vec<Effect>) -> Self {
        Self {
            originator: originator.into(),
            changes: None,
            effects,
            version: None,
        }
    }

    /// Whether this update changes document text.
    pub fn is_effects_only(&self) -> bool {
        self.changes.is_none()
    }
}

/// Rebase a sequence of updates against an accepted tail.
///
/// Used identically on both sides of the protocol: the authority rebases
/// a stale push against the log tail past the pusher's base version, and
/// a peer rebases its pending queue across a foreign broadcast. Changes
/// go through the algebra's rebase primitive; effect positions are folded
/// through `map_position`; effect-only updates pass through with their
/// effects remapped.
pub fn rebase_updates<A: ChangeAlgebra>(
    algebra: &A,
    updates: Vec<Update<A::Change>>,
    against: &[Arc<Update<A::Change>>],
) -> Result<Vec<Update<A::Change>>, AlgebraError> {
    let against_changes: Vec<&A::Change> =
        against.iter().filter_map(|u| u.changes.as_ref()).collect();
    if against_changes.is_empty() {
        return Ok(updates);
    }

    let pending_changes: Vec<A::Change> = updates
        .iter()
        .filter_map(|u| u.changes.clone())
        .collect();
    let owned: Vec<A::Change> = against_changes.iter().map(|&c| c.clone()).collect();
    let mut rebased_changes = algebra.rebase(&pending_changes, &owned)?.into_iter();

    let mut out = Vec::with_capacity(updates.len());
    for update in updates {
        let changes = match update.changes {
            Some(_) => Some(rebased_changes.next().ok_or_else(|| {
                AlgebraError::new("rebase returned fewer changes than it was given")
            })?),
            None => None,
        };
        let effects = update
            .effects
            .iter()
            .map(|e| e.remapped(algebra, &against_changes))
            .collect();
        out.push(Update {
            originator: update.originator,
            changes,
            effects,
            version: None,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{splice, SpliceAlgebra};

    #[test]
    fn test_effect_remap_presence() {
        let algebra = SpliceAlgebra;
        let insert = splice(1, 0, "xx");
        let effect = Effect::Presence {
            tag: "1".into(),
            positions: vec![0, 3],
        };
        let remapped = effect.remapped(&algebra, &[&insert]);
        assert_eq!(
            remapped,
            Effect::Presence {
                tag: "1".into(),
                positions: vec![0, 5],
            }
        );
    }

    #[test]
    fn test_effect_remap_title_untouched() {
        let algebra = SpliceAlgebra;
        let insert = splice(0, 0, "abc");
        let effect = Effect::Title {
            value: "draft".into(),
        };
        assert_eq!(effect.remapped(&algebra, &[&insert]), effect);
    }

    #[test]
    fn test_rebase_updates_shifts_changes_and_effects() {
        let algebra = SpliceAlgebra;
        // Accepted: insert "1" at offset 1.
        let accepted = Arc::new(Update::edit("x", splice(1, 0, "1"), vec![]));
        // Pending: insert "2" at offset 2, cursor at 2.
        let pending = vec![Update::edit(
            "y",
            splice(2, 0, "2"),
            vec![Effect::Presence {
                tag: "2".into(),
                positions: vec![2],
            }],
        )];

        let rebased = rebase_updates(&algebra, pending, &[accepted]).unwrap();
        assert_eq!(rebased.len(), 1);
        assert_eq!(rebased[0].changes, Some(splice(3, 0, "2")));
        assert_eq!(
            rebased[0].effects[0],
            Effect::Presence {
                tag: "2".into(),
                positions: vec![3],
            }
        );
        assert_eq!(rebased[0].version, None);
    }

    #[test]
    fn test_rebase_updates_effects_only_passes_through() {
        let algebra = SpliceAlgebra;
        let accepted = Arc::new(Update::edit("x", splice(0, 0, "ab"), vec![]));
        let pending = vec![Update::<crate::testing::Splice>::effects_only(
            "y",
            vec![Effect::Presence {
                tag: "2".into(),
                positions: vec![1],
            }],
        )];

        let rebased = rebase_updates(&algebra, pending, &[accepted]).unwrap();
        assert!(rebased[0].is_effects_only());
        assert_eq!(
            rebased[0].effects[0],
            Effect::Presence {
                tag: "2".into(),
                positions: vec![3],
            }
        );
    }

    #[test]
    fn test_rebase_updates_no_against_changes_is_identity() {
        let algebra = SpliceAlgebra;
        let accepted = Arc::new(Update::<crate::testing::Splice>::effects_only(
            "x",
            vec![],
        ));
        let pending = vec![Update::edit("y", splice(0, 0, "hi"), vec![])];
        let rebased = rebase_updates(&algebra, pending.clone(), &[accepted]).unwrap();
        assert_eq!(rebased, pending);
    }
}

//! Minimal splice-based change algebra for unit tests.
//!
//! One change is a single contiguous replacement. Rebase shifts the
//! later edit past the earlier one; ties go to the change that was
//! accepted first. Good enough to exercise the protocol; real
//! deployments bring their own algebra.

use serde::{Deserialize, Serialize};

use crate::algebra::{AlgebraError, ChangeAlgebra};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Splice {
    pub at: usize,
    pub delete: usize,
    pub insert: String,
}

pub fn splice(at: usize, delete: usize, insert: &str) -> Splice {
    Splice {
        at,
        delete,
        insert: insert.to_string(),
    }
}

pub struct SpliceAlgebra;

impl SpliceAlgebra {
    /// Re-anchor `s` so it applies after `t`.
    fn transform(s: &Splice, t: &Splice) -> Splice {
        let start = Self::map(s.at, t, true);
        let end = Self::map(s.at + s.delete, t, false);
        Splice {
            at: start,
            delete: end.saturating_sub(start),
            insert: s.insert.clone(),
        }
    }

    /// Map an offset across `t`. `before` biases an offset exactly at
    /// the splice point to stay in front of the inserted text.
    fn map(pos: usize, t: &Splice, before: bool) -> usize {
        if pos < t.at || (before && pos == t.at && t.delete > 0) {
            pos
        } else if pos >= t.at + t.delete {
            pos - t.delete + t.insert.len()
        } else {
            t.at + t.insert.len()
        }
    }
}

impl ChangeAlgebra for SpliceAlgebra {
    type Change = Splice;

    fn apply(&self, doc: &str, change: &Splice) -> Result<String, AlgebraError> {
        let end = change.at + change.delete;
        if change.at > doc.len() || end > doc.len() {
            return Err(AlgebraError::new(format!(
                "splice {}..{} out of bounds for document of length {}",
                change.at,
                end,
                doc.len()
            )));
        }
        let mut out = String::with_capacity(doc.len() + change.insert.len());
        out.push_str(&doc[..change.at]);
        out.push_str(&change.insert);
        out.push_str(&doc[end..]);
        Ok(out)
    }

    fn rebase(
        &self,
        pending: &[Splice],
        against: &[Splice],
    ) -> Result<Vec<Splice>, AlgebraError> {
        // `against_now` tracks the against-changes re-anchored past each
        // emitted pending change, so later pendings (which were made on
        // top of earlier ones) transform correctly.
        let mut against_now: Vec<Splice> = against.to_vec();
        let mut out = Vec::with_capacity(pending.len());
        for p in pending {
            let mut q = p.clone();
            for a in &against_now {
                q = Self::transform(&q, a);
            }
            against_now = against_now
                .iter()
                .map(|a| Self::transform(a, p))
                .collect();
            out.push(q);
        }
        Ok(out)
    }

    fn map_position(&self, pos: usize, change: &Splice) -> usize {
        Self::map(pos, change, true)
    }
}

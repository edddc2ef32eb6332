//! Snapshot/delta alignment for venues with an out-of-band snapshot.
//!
//! On (re)connect the connector buffers push deltas, fetches the REST
//! snapshot, then feeds the buffer through [`DeltaSequencer::check`]:
//! deltas entirely at or before the snapshot are skipped, the first
//! retained delta must span `snapshot_id + 1`, and every later delta must
//! chain onto its predecessor under the venue's continuity rule. Any
//! break in the chain is a [`SyncError`] and forces a full resync.

use std::fmt;

use crate::models::DepthUpdate;

/// How a venue expresses delta continuity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuityRule {
    /// `prev_update_id` must equal the previous delta's final id.
    PrevMatchesFinal,
    /// `first_update_id` must equal the previous delta's final id + 1.
    FirstFollowsFinal,
}

/// What to do with a delta that passed through the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqAction {
    Apply,
    /// Entirely covered by the snapshot or a duplicate; drop it.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// The first delta after the snapshot does not span `snapshot_id + 1`.
    SnapshotNotSpanned { snapshot_id: u64, first_id: u64 },
    /// A later delta broke the continuity chain.
    Gap {
        last_final: u64,
        first_id: u64,
        prev_id: u64,
    },
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SnapshotNotSpanned {
                snapshot_id,
                first_id,
            } => write!(
                f,
                "first delta (first_id={first_id}) does not span snapshot id {snapshot_id}"
            ),
            Self::Gap {
                last_final,
                first_id,
                prev_id,
            } => write!(
                f,
                "sequence gap after final_id={last_final} (first_id={first_id}, prev_id={prev_id})"
            ),
        }
    }
}

impl std::error::Error for SyncError {}

/// Tracks delta continuity from a snapshot onwards.
#[derive(Debug, Clone)]
pub struct DeltaSequencer {
    rule: ContinuityRule,
    last_final: u64,
    spanned: bool,
}

impl DeltaSequencer {
    /// Starts a chain at the snapshot's id; the next applied delta must
    /// span `snapshot_id + 1`.
    pub fn after_snapshot(rule: ContinuityRule, snapshot_id: u64) -> Self {
        Self {
            rule,
            last_final: snapshot_id,
            spanned: false,
        }
    }

    pub fn last_final(&self) -> u64 {
        self.last_final
    }

    /// Classifies one delta against the chain.
    pub fn check(&mut self, delta: &DepthUpdate) -> Result<SeqAction, SyncError> {
        if delta.final_update_id <= self.last_final {
            return Ok(SeqAction::Skip);
        }

        if !self.spanned {
            // First delta past the snapshot: its id range must cover the
            // event immediately after the snapshot.
            if delta.first_update_id > self.last_final + 1 {
                return Err(SyncError::SnapshotNotSpanned {
                    snapshot_id: self.last_final,
                    first_id: delta.first_update_id,
                });
            }
            self.spanned = true;
            self.last_final = delta.final_update_id;
            return Ok(SeqAction::Apply);
        }

        let contiguous = match self.rule {
            ContinuityRule::PrevMatchesFinal => delta.prev_update_id == self.last_final,
            ContinuityRule::FirstFollowsFinal => delta.first_update_id == self.last_final + 1,
        };
        if !contiguous {
            return Err(SyncError::Gap {
                last_final: self.last_final,
                first_id: delta.first_update_id,
                prev_id: delta.prev_update_id,
            });
        }
        self.last_final = delta.final_update_id;
        Ok(SeqAction::Apply)
    }

    /// Runs the buffered deltas gathered before the snapshot arrived.
    /// Returns the deltas to apply, in order.
    pub fn align(&mut self, buffered: Vec<DepthUpdate>) -> Result<Vec<DepthUpdate>, SyncError> {
        let mut to_apply = Vec::with_capacity(buffered.len());
        for delta in buffered {
            match self.check(&delta)? {
                SeqAction::Apply => to_apply.push(delta),
                SeqAction::Skip => {}
            }
        }
        Ok(to_apply)
    }
}

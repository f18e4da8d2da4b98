//! Conflict resolution between the two write paths.

use chrono::{DateTime, Utc};

use crate::config::ConflictResolution;

/// Which store a write is headed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Periodic batch path
    Relational,
    /// Real-time mirror path
    Content,
}

/// Outcome of resolving one incoming record against the target's copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Write,
    /// The target's copy wins under the policy.
    Skip,
    /// Both sides changed and the policy wants a human to decide.
    Conflict,
}

/// The target's current copy of a record, as far as resolution cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Existing {
    Absent,
    /// Present, with its update timestamp if it has a readable one.
    Present(Option<DateTime<Utc>>),
}

/// Applies a [`ConflictResolution`] policy to individual writes.
#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
    policy: ConflictResolution,
}

impl ConflictResolver {
    pub fn new(policy: ConflictResolution) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ConflictResolution {
        self.policy
    }

    /// Whether resolving writes to `target` depends on the existing copy.
    ///
    /// When it does not, callers can skip reading the target.
    pub fn needs_existing(&self, target: Target) -> bool {
        !matches!(
            (self.policy, target),
            (ConflictResolution::ContentWins, Target::Relational)
                | (ConflictResolution::RelationalWins, Target::Content)
        )
    }

    /// Decide whether an incoming record updated at `incoming` may
    /// overwrite `existing` in `target`.
    ///
    /// Missing timestamps count as older than any timestamp.
    pub fn resolve(&self, target: Target, incoming: Option<DateTime<Utc>>, existing: Existing) -> Verdict {
        let existing_at = match existing {
            Existing::Absent => return Verdict::Write,
            Existing::Present(at) => at,
        };

        match (self.policy, target) {
            (ConflictResolution::ContentWins, Target::Relational)
            | (ConflictResolution::RelationalWins, Target::Content) => Verdict::Write,
            (ConflictResolution::ContentWins, Target::Content)
            | (ConflictResolution::RelationalWins, Target::Relational) => Verdict::Skip,
            (ConflictResolution::LastWriteWins, _) => {
                if existing_at > incoming {
                    Verdict::Skip
                } else {
                    Verdict::Write
                }
            }
            (ConflictResolution::Manual, _) => {
                if existing_at == incoming {
                    Verdict::Write
                } else {
                    Verdict::Conflict
                }
            }
        }
    }
}

//! Live notifications emitted while a tournament runs.

use crate::{
    battle::{BattleId, BattleStatus},
    round::RoundOutcome,
    scoring::BattleScore,
};

/// One step of a tournament run, sent on the channel given to
/// [`Tournament::with_progress`](crate::tournament::Tournament::with_progress).
///
/// Events of one battle arrive in order; events of different battles interleave freely.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A worker picked the battle up.
    BattleStarted {
        /// Battle concerned.
        battle: BattleId,
    },
    /// A round was recorded. Retained payloads are not forwarded.
    RoundCompleted {
        /// Battle concerned.
        battle: BattleId,
        /// The recorded round.
        outcome: RoundOutcome,
    },
    /// The battle reached a terminal status. Sent exactly once per battle, including battles
    /// cancelled before they started.
    BattleFinished {
        /// Battle concerned.
        battle: BattleId,
        /// Terminal status.
        status: BattleStatus,
        /// Score, when the battle could be scored.
        score: Option<BattleScore>,
    },
}

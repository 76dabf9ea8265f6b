//! A battle: one team's generator against another team's solver, round after round.

use std::{fmt, sync::mpsc::Sender, sync::Arc};

use rand::{rngs::StdRng, RngCore, SeedableRng};
use tracing::{error, info, instrument, trace};

use crate::{
    cancellation::Cancellation,
    match_executor::MatchExecutor,
    progress::ProgressEvent,
    protocol::{Protocol, ProtocolConfig, Replay},
    round::{RoundOutcome, Verdict},
    scoring::{score, BattleScore},
    team::Team,
};

/// Identifies a battle inside a tournament run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BattleId {
    /// Team whose generator creates the instances.
    pub generator: Arc<Team>,
    /// Team whose solver must solve them.
    pub solver: Arc<Team>,
    /// Repetition of this ordered pair, starting at 0.
    pub repetition: usize,
}

impl fmt::Display for BattleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.generator, self.solver)?;
        if self.repetition > 0 {
            write!(f, "#{}", self.repetition)?;
        }
        Ok(())
    }
}

/// Protocol state of a battle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BattleState {
    /// No round played yet.
    Start,
    /// Rounds are being played.
    Running,
    /// The protocol will not request any more rounds.
    Concluded,
}

/// Which deadline or request interrupted a battle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelScope {
    /// The battle's own deadline. The partial history is still scored.
    Battle,
    /// The whole tournament run was cancelled or ran out of time.
    Tournament,
}

/// Terminal status of a battle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BattleStatus {
    /// The protocol concluded normally.
    Concluded,
    /// Interrupted before the protocol concluded.
    Cancelled {
        /// What triggered the interruption.
        scope: CancelScope,
    },
    /// An infrastructure error stopped the battle; it cannot be scored.
    Failed {
        /// Description of the error, with its causes.
        error: String,
    },
}

impl fmt::Display for BattleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BattleStatus::Concluded => write!(f, "concluded"),
            BattleStatus::Cancelled {
                scope: CancelScope::Battle,
            } => write!(f, "battle deadline"),
            BattleStatus::Cancelled {
                scope: CancelScope::Tournament,
            } => write!(f, "cancelled"),
            BattleStatus::Failed { error } => write!(f, "failed: {error}"),
        }
    }
}

/// Everything known about a finished battle.
#[derive(Debug, Clone)]
pub struct BattleReport {
    /// Battle concerned.
    pub id: BattleId,
    /// How it ended.
    pub status: BattleStatus,
    /// Every recorded round, in order.
    pub history: Vec<RoundOutcome>,
    /// Present for concluded battles and battles stopped by their own deadline.
    pub score: Option<BattleScore>,
}

impl BattleReport {
    /// Report of a battle that never got to play.
    pub(crate) fn not_started(id: BattleId) -> BattleReport {
        BattleReport {
            id,
            status: BattleStatus::Cancelled {
                scope: CancelScope::Tournament,
            },
            history: vec![],
            score: None,
        }
    }
}

/// Round-by-round driver of one battle.
#[derive(Debug)]
pub struct Battle {
    id: BattleId,
    state: BattleState,
    history: Vec<RoundOutcome>,
    replay: Option<Replay>,
    rng: StdRng,
}

impl Battle {
    /// A battle drawing its round seeds from `seed`.
    pub fn new(id: BattleId, seed: u64) -> Battle {
        Battle {
            id,
            state: BattleState::Start,
            history: vec![],
            replay: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Battle identifier.
    pub fn id(&self) -> &BattleId {
        &self.id
    }

    /// Current protocol state.
    pub fn state(&self) -> BattleState {
        self.state
    }

    /// Rounds recorded so far.
    pub fn history(&self) -> &[RoundOutcome] {
        &self.history
    }

    /// Plays the round the protocol asks for next, or concludes the battle.
    ///
    /// Returns `Ok(None)` once the battle is concluded. Errors are infrastructure errors.
    /// Every call must pass the same protocol.
    pub fn play_round(
        &mut self,
        protocol: &dyn Protocol,
        executor: &MatchExecutor<'_>,
        cancellation: &Cancellation,
    ) -> anyhow::Result<Option<&RoundOutcome>> {
        if self.state == BattleState::Concluded {
            return Ok(None);
        }
        let replay = self
            .replay
            .get_or_insert_with(|| protocol.replay(&self.history));
        let Some(size) = replay.next_size() else {
            trace!("protocol concluded after {} rounds", self.history.len());
            self.state = BattleState::Concluded;
            return Ok(None);
        };
        self.state = BattleState::Running;

        let seed = self.rng.next_u64();
        let outcome = executor.run_round(
            &self.id.generator.generator,
            &self.id.solver.solver,
            self.history.len(),
            size,
            seed,
            cancellation,
        )?;
        trace!(%outcome);
        protocol.record(replay, &outcome);
        self.history.push(outcome);
        Ok(self.history.last())
    }

    fn is_complete(&self, protocol: &ProtocolConfig) -> bool {
        let interrupted = self.history.last().is_some_and(|round| {
            round.verdict(protocol.approximation_tolerance()) == Verdict::Cancelled
        });
        !interrupted
            && self
                .replay
                .as_ref()
                .map_or_else(|| protocol.is_concluded(&self.history), Replay::is_concluded)
    }

    /// Plays the battle until it concludes, is cancelled, or fails.
    ///
    /// `cancellation` fires either on the battle's own deadline, giving a scored
    /// [`CancelScope::Battle`] report, or because an ancestor fired, giving an unscored
    /// [`CancelScope::Tournament`] report.
    #[instrument(skip_all, fields(battle = %self.id))]
    pub fn run(
        mut self,
        protocol: &ProtocolConfig,
        executor: &MatchExecutor<'_>,
        cancellation: &Cancellation,
        progress: Option<&Sender<ProgressEvent>>,
    ) -> BattleReport {
        info!("battle started");
        notify(
            progress,
            ProgressEvent::BattleStarted {
                battle: self.id.clone(),
            },
        );

        let status = loop {
            if cancellation.is_cancelled() && !self.is_complete(protocol) {
                let scope = if cancellation.fired_locally() {
                    CancelScope::Battle
                } else {
                    CancelScope::Tournament
                };
                break BattleStatus::Cancelled { scope };
            }
            match self.play_round(protocol, executor, cancellation) {
                Ok(Some(outcome)) => {
                    if progress.is_some() {
                        let mut outcome = outcome.clone();
                        outcome.instance = None;
                        outcome.certificate = None;
                        notify(
                            progress,
                            ProgressEvent::RoundCompleted {
                                battle: self.id.clone(),
                                outcome,
                            },
                        );
                    }
                }
                Ok(None) => break BattleStatus::Concluded,
                Err(e) => {
                    error!("infrastructure error: {e:#}");
                    break BattleStatus::Failed {
                        error: format!("{e:#}"),
                    };
                }
            }
        };

        let score = match status {
            BattleStatus::Concluded
            | BattleStatus::Cancelled {
                scope: CancelScope::Battle,
            } => Some(score(&self.history, protocol)),
            _ => None,
        };
        match &score {
            Some(score) => info!(%status, %score, rounds = self.history.len(), "battle finished"),
            None => info!(%status, rounds = self.history.len(), "battle finished"),
        }
        notify(
            progress,
            ProgressEvent::BattleFinished {
                battle: self.id.clone(),
                status: status.clone(),
                score: score.clone(),
            },
        );

        BattleReport {
            id: self.id,
            status,
            history: self.history,
            score,
        }
    }
}

fn notify(progress: Option<&Sender<ProgressEvent>>, event: ProgressEvent) {
    if let Some(tx) = progress {
        // a dropped receiver only means nobody is watching
        let _ = tx.send(event);
    }
}

//! Protocols decide the size of every round of a battle and when the battle is over.
//!
//! A protocol never keeps state of its own: every decision follows from the history of
//! [`RoundOutcome`]s recorded so far. A [`Replay`] is the position reached after some rounds;
//! battles keep one up to date round by round, and the scoring functions replay the very same
//! decisions, so both always agree on which rounds count.
//!
//! Two variants are provided, selected through [`ProtocolConfig`]:
//! - [`IterativeCapacity`]: grow the size after every solver success until the solver fails
//!   `failure_streak` times in a row. The score is the largest size solved.
//! - [`FixedSizeRepeated`]: a fixed number of rounds at a constant size. The score is the
//!   success rate.

use std::fmt::Debug;

use anyhow::bail;

use crate::{
    problem::Problem,
    round::{RoundOutcome, Verdict},
};

/// Position of a protocol after a number of rounds.
#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    played: usize,
    next: Option<u64>,
    streak: u32,
    increments: u64,
    ceiling: Option<u64>,
    last_solved: Option<u64>,
}

impl Replay {
    fn new(first_size: u64) -> Replay {
        Replay {
            played: 0,
            next: Some(first_size),
            streak: 0,
            increments: 0,
            ceiling: None,
            last_solved: None,
        }
    }

    /// Size of the next round, `None` once concluded.
    pub fn next_size(&self) -> Option<u64> {
        self.next
    }

    /// True once no more rounds must be played.
    pub fn is_concluded(&self) -> bool {
        self.next.is_none()
    }

    /// Rounds consumed so far. Rounds recorded after the conclusion are not counted.
    pub fn played(&self) -> usize {
        self.played
    }

    /// Ask for a round of `size` next.
    pub fn set_next_size(&mut self, size: u64) {
        self.next = Some(size);
    }

    /// Stop the battle.
    pub fn conclude(&mut self) {
        self.next = None;
    }
}

/// Size policy and termination test of a battle.
pub trait Protocol: Send + Sync + Debug {
    /// Size of the first round.
    fn first_size(&self) -> u64;

    /// Absolute bound on the number of rounds of a battle.
    fn max_rounds(&self) -> usize;

    /// Moves `replay` past `round`. Only called while `replay` is not concluded, with
    /// [`Replay::played`] already counting `round`.
    fn advance(&self, replay: &mut Replay, round: &RoundOutcome);

    /// Position before the first round.
    fn start(&self) -> Replay {
        Replay::new(self.first_size())
    }

    /// Records one more round into `replay`. Rounds after the conclusion are ignored.
    fn record(&self, replay: &mut Replay, round: &RoundOutcome) {
        if replay.is_concluded() {
            return;
        }
        replay.played += 1;
        self.advance(replay, round);
        if replay.played >= self.max_rounds() {
            replay.conclude();
        }
    }

    /// Position reached after `history`, stopping at the conclusion.
    fn replay(&self, history: &[RoundOutcome]) -> Replay {
        let mut replay = self.start();
        for round in history {
            if replay.is_concluded() {
                break;
            }
            self.record(&mut replay, round);
        }
        replay
    }

    /// Size of the round following `history`, or `None` once the battle is concluded.
    fn next_size(&self, history: &[RoundOutcome]) -> Option<u64> {
        self.replay(history).next_size()
    }

    /// True once no more rounds must be played after `history`.
    fn is_concluded(&self, history: &[RoundOutcome]) -> bool {
        self.replay(history).is_concluded()
    }

    /// Number of leading rounds of `history` played before the protocol concluded.
    ///
    /// Equals `history.len()` for a battle that was driven by this protocol.
    fn concluded_at(&self, history: &[RoundOutcome]) -> usize {
        self.replay(history).played()
    }
}

/// Grows the instance size while the solver keeps up.
///
/// With the default fixed step, the size increases by `step` after a solver success (up to
/// `max_size`) and stays the same after a failure. The battle concludes after
/// `failure_streak` consecutive solver failures, after a success at `max_size`, or after
/// `max_rounds` rounds. Rounds lost to the generator, and cancelled rounds, change nothing.
///
/// With [`with_exponent`](Self::with_exponent) the search accelerates instead: the `i`-th
/// success in a row adds `step * i^exponent`. A failure right after such a jump is not held
/// against the solver: the failed size becomes an exclusive ceiling and the search restarts
/// one `step` above the last size solved. Jumps that would reach the ceiling fall back to a
/// single `step`, and a success just below the ceiling concludes the battle.
#[derive(Debug, Clone, PartialEq)]
pub struct IterativeCapacity {
    pub(crate) min_size: Option<u64>,
    pub(crate) step: u64,
    pub(crate) exponent: Option<u32>,
    pub(crate) failure_streak: u32,
    pub(crate) max_rounds: usize,
    pub(crate) max_size: Option<u64>,
    pub(crate) approximation_tolerance: f64,
}

impl Default for IterativeCapacity {
    fn default() -> Self {
        Self::new()
    }
}

impl IterativeCapacity {
    /// Start at the problem's minimum size, step 1, conclude after 2 failures or 100 rounds.
    pub fn new() -> Self {
        Self {
            min_size: None,
            step: 1,
            exponent: None,
            failure_streak: 2,
            max_rounds: 100,
            max_size: None,
            approximation_tolerance: 1.0,
        }
    }

    /// Size of the first round. Defaults to [`Problem::min_size`].
    pub fn with_min_size(self, size: u64) -> Self {
        Self {
            min_size: Some(size),
            ..self
        }
    }

    /// Size increase after each solver success, or base of the increase with an exponent.
    pub fn with_step(self, step: u64) -> Self {
        Self { step, ..self }
    }

    /// Switch to the accelerating search, `i` consecutive successes adding
    /// `step * i^exponent`.
    pub fn with_exponent(self, exponent: u32) -> Self {
        Self {
            exponent: Some(exponent),
            ..self
        }
    }

    /// Number of consecutive solver failures that concludes the battle.
    pub fn with_failure_streak(self, failures: u32) -> Self {
        Self {
            failure_streak: failures,
            ..self
        }
    }

    /// Hard bound on the number of rounds.
    pub fn with_max_rounds(self, rounds: usize) -> Self {
        Self {
            max_rounds: rounds,
            ..self
        }
    }

    /// Largest size ever requested. A success at this size concludes the battle.
    pub fn with_max_size(self, size: u64) -> Self {
        Self {
            max_size: Some(size),
            ..self
        }
    }

    /// Highest approximation ratio still accepted as a success.
    pub fn with_approximation_tolerance(self, tolerance: f64) -> Self {
        Self {
            approximation_tolerance: tolerance,
            ..self
        }
    }

    fn start_size(&self) -> u64 {
        let start = self.min_size.unwrap_or(1);
        match self.max_size {
            Some(max) => start.min(max),
            None => start,
        }
    }

    fn fail(&self, replay: &mut Replay) {
        replay.streak += 1;
        if replay.streak >= self.failure_streak {
            replay.conclude();
        }
    }

    fn advance_linear(&self, replay: &mut Replay, size: u64, verdict: Verdict) {
        match verdict {
            Verdict::Solved => {
                replay.streak = 0;
                replay.next = match self.max_size {
                    Some(max) if size >= max => None,
                    Some(max) => Some(size.saturating_add(self.step).min(max)),
                    None => Some(size.saturating_add(self.step)),
                };
            }
            Verdict::Failed => self.fail(replay),
            Verdict::GeneratorFault | Verdict::Cancelled => {}
        }
    }

    fn advance_accelerating(
        &self,
        replay: &mut Replay,
        size: u64,
        verdict: Verdict,
        exponent: u32,
    ) {
        match verdict {
            Verdict::Solved => {
                replay.streak = 0;
                replay.last_solved = Some(size);
                if replay.ceiling.is_some_and(|c| size.saturating_add(1) >= c) {
                    replay.conclude();
                    return;
                }
                replay.increments += 1;
                let jump = replay
                    .increments
                    .checked_pow(exponent)
                    .and_then(|p| p.checked_mul(self.step))
                    .unwrap_or(u64::MAX);
                let mut next = size.saturating_add(jump);
                if let Some(ceiling) = replay.ceiling {
                    if next >= ceiling {
                        next = size.saturating_add(self.step).min(ceiling - 1);
                        replay.increments = 1;
                    }
                }
                replay.next = Some(next);
            }
            Verdict::Failed => match replay.last_solved {
                Some(solved) if replay.increments > 1 => {
                    // the last jump overshot, search again below the failed size
                    replay.ceiling = Some(replay.ceiling.map_or(size, |c| c.min(size)));
                    replay.increments = 1;
                    replay.streak = 0;
                    let restart = solved.saturating_add(self.step);
                    replay.next = Some(restart.min(size.saturating_sub(1)));
                }
                _ => self.fail(replay),
            },
            Verdict::GeneratorFault | Verdict::Cancelled => {}
        }
    }
}

impl Protocol for IterativeCapacity {
    fn first_size(&self) -> u64 {
        self.start_size()
    }

    fn max_rounds(&self) -> usize {
        self.max_rounds
    }

    fn start(&self) -> Replay {
        let mut replay = Replay::new(self.start_size());
        // the ceiling is exclusive, a configured max size is not
        replay.ceiling = self.max_size.map(|max| max.saturating_add(1));
        replay
    }

    fn advance(&self, replay: &mut Replay, round: &RoundOutcome) {
        let Some(size) = replay.next else {
            return;
        };
        let verdict = round.verdict(self.approximation_tolerance);
        match self.exponent {
            None => self.advance_linear(replay, size, verdict),
            Some(exponent) => self.advance_accelerating(replay, size, verdict, exponent),
        }
    }
}

/// Plays `rounds` rounds at a constant `size`, each with a fresh seed.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedSizeRepeated {
    pub(crate) size: u64,
    pub(crate) rounds: usize,
    pub(crate) approximation_tolerance: f64,
}

impl FixedSizeRepeated {
    /// `rounds` rounds at `size`, only optimal certificates count.
    pub fn new(size: u64, rounds: usize) -> Self {
        Self {
            size,
            rounds,
            approximation_tolerance: 1.0,
        }
    }

    /// Highest approximation ratio still accepted as a success.
    pub fn with_approximation_tolerance(self, tolerance: f64) -> Self {
        Self {
            approximation_tolerance: tolerance,
            ..self
        }
    }
}

impl Protocol for FixedSizeRepeated {
    fn first_size(&self) -> u64 {
        self.size
    }

    fn max_rounds(&self) -> usize {
        self.rounds
    }

    fn advance(&self, _replay: &mut Replay, _round: &RoundOutcome) {}
}

/// Protocol selection, fixed when battles are created.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolConfig {
    /// See [`IterativeCapacity`].
    IterativeCapacity(IterativeCapacity),
    /// See [`FixedSizeRepeated`].
    FixedSizeRepeated(FixedSizeRepeated),
}

impl From<IterativeCapacity> for ProtocolConfig {
    fn from(value: IterativeCapacity) -> Self {
        ProtocolConfig::IterativeCapacity(value)
    }
}

impl From<FixedSizeRepeated> for ProtocolConfig {
    fn from(value: FixedSizeRepeated) -> Self {
        ProtocolConfig::FixedSizeRepeated(value)
    }
}

fn check_tolerance(tolerance: f64) -> anyhow::Result<()> {
    if !tolerance.is_finite() || tolerance < 1.0 {
        bail!("approximation tolerance must be a finite ratio >= 1.0 (got {tolerance})");
    }
    Ok(())
}

impl ProtocolConfig {
    /// Rejects parameters that would make a battle meaningless or unbounded.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            ProtocolConfig::IterativeCapacity(p) => {
                if p.step == 0 {
                    bail!("iterative step must be at least 1");
                }
                if p.failure_streak == 0 {
                    bail!("failure streak must be at least 1");
                }
                if p.exponent == Some(0) {
                    bail!("step exponent must be at least 1");
                }
                if p.max_rounds == 0 {
                    bail!("max rounds must be at least 1");
                }
                if let (Some(min), Some(max)) = (p.min_size, p.max_size) {
                    if min > max {
                        bail!("min size ({min}) is larger than max size ({max})");
                    }
                }
                check_tolerance(p.approximation_tolerance)
            }
            ProtocolConfig::FixedSizeRepeated(p) => {
                if p.rounds == 0 {
                    bail!("fixed size battles need at least 1 round");
                }
                check_tolerance(p.approximation_tolerance)
            }
        }
    }

    /// Fills in the defaults that depend on `problem`.
    pub fn resolve(&self, problem: &dyn Problem) -> ProtocolConfig {
        match self {
            ProtocolConfig::IterativeCapacity(p) if p.min_size.is_none() => {
                ProtocolConfig::IterativeCapacity(p.clone().with_min_size(problem.min_size()))
            }
            other => other.clone(),
        }
    }

    /// Highest approximation ratio accepted as a solver success.
    pub fn approximation_tolerance(&self) -> f64 {
        match self {
            ProtocolConfig::IterativeCapacity(p) => p.approximation_tolerance,
            ProtocolConfig::FixedSizeRepeated(p) => p.approximation_tolerance,
        }
    }

    fn inner(&self) -> &dyn Protocol {
        match self {
            ProtocolConfig::IterativeCapacity(p) => p,
            ProtocolConfig::FixedSizeRepeated(p) => p,
        }
    }
}

impl Protocol for ProtocolConfig {
    fn first_size(&self) -> u64 {
        self.inner().first_size()
    }

    fn max_rounds(&self) -> usize {
        self.inner().max_rounds()
    }

    fn advance(&self, replay: &mut Replay, round: &RoundOutcome) {
        self.inner().advance(replay, round)
    }

    fn start(&self) -> Replay {
        self.inner().start()
    }
}

#[cfg(test)]
pub(crate) mod protocol_tests {
    use super::*;
    use crate::round::{GeneratorResult, SolverResult, Usage};

    pub(crate) fn round(size: u64, generator: GeneratorResult, solver: Option<SolverResult>) -> RoundOutcome {
        RoundOutcome {
            index: 0,
            size,
            seed: 0,
            generator,
            generator_usage: Usage::default(),
            solver,
            solver_usage: solver.map(|_| Usage::default()),
            approximation_ratio: (solver == Some(SolverResult::Ok)).then_some(1.0),
            instance: None,
            certificate: None,
        }
    }

    pub(crate) fn ok(size: u64) -> RoundOutcome {
        round(size, GeneratorResult::Ok, Some(SolverResult::Ok))
    }

    pub(crate) fn fail(size: u64) -> RoundOutcome {
        round(size, GeneratorResult::Ok, Some(SolverResult::Timeout))
    }

    pub(crate) fn crash(size: u64) -> RoundOutcome {
        round(size, GeneratorResult::Crash, None)
    }

    /// Plays a battle against a scripted solver answering `solves(size)`.
    fn drive(protocol: &dyn Protocol, solves: impl Fn(u64) -> bool) -> Vec<RoundOutcome> {
        let mut history = vec![];
        while let Some(size) = protocol.next_size(&history) {
            history.push(if solves(size) { ok(size) } else { fail(size) });
            assert!(history.len() <= protocol.max_rounds());
        }
        history
    }

    #[test]
    fn iterative_grows_until_streak() {
        let protocol = IterativeCapacity::new().with_min_size(1).with_failure_streak(2);
        assert_eq!(protocol.first_size(), 1);

        let history = drive(&protocol, |size| size <= 3);
        let sizes = history.iter().map(|r| r.size).collect::<Vec<_>>();
        assert_eq!(sizes, vec![1, 2, 3, 4, 4]);
        assert!(protocol.is_concluded(&history));
    }

    #[test]
    fn failure_streak_resets_on_success() {
        let protocol = IterativeCapacity::new().with_failure_streak(2);
        let history = vec![ok(1), fail(2), ok(2)];
        assert_eq!(protocol.next_size(&history), Some(3));
        let history = vec![ok(1), fail(2), fail(2)];
        assert_eq!(protocol.next_size(&history), None);
    }

    #[test]
    fn generator_faults_change_nothing() {
        let protocol = IterativeCapacity::new().with_failure_streak(1).with_max_rounds(5);
        let history = vec![ok(1), crash(2), crash(2)];
        assert_eq!(protocol.next_size(&history), Some(2));

        let history = drive(&protocol, |_| true);
        assert_eq!(history.len(), 5);

        let always_crash = (0..5).map(|_| crash(1)).collect::<Vec<_>>();
        assert!(protocol.is_concluded(&always_crash));
        assert_eq!(protocol.concluded_at(&always_crash), 5);
    }

    #[test]
    fn max_size_caps_and_concludes() {
        let protocol = IterativeCapacity::new().with_step(4).with_max_size(10);
        let history = drive(&protocol, |_| true);
        let sizes = history.iter().map(|r| r.size).collect::<Vec<_>>();
        assert_eq!(sizes, vec![1, 5, 9, 10]);
    }

    #[test]
    fn tolerance_turns_bad_approximations_into_failures() {
        let mut approx = ok(1);
        approx.approximation_ratio = Some(1.5);
        let strict = IterativeCapacity::new().with_failure_streak(1);
        assert_eq!(strict.next_size(&[approx.clone()]), None);
        let lenient = strict.with_approximation_tolerance(2.0);
        assert_eq!(lenient.next_size(&[approx]), Some(2));
    }

    #[test]
    fn concluded_at_ignores_trailing_rounds() {
        let protocol = IterativeCapacity::new().with_failure_streak(1);
        let history = vec![ok(1), fail(2), ok(2), ok(3)];
        assert_eq!(protocol.concluded_at(&history), 2);
        let relaxed = protocol.clone().with_failure_streak(3);
        assert_eq!(relaxed.concluded_at(&history), 4);
    }

    #[test]
    fn accelerating_search_steps_back_below_failures() {
        let protocol = IterativeCapacity::new()
            .with_min_size(1)
            .with_exponent(2)
            .with_failure_streak(1);

        let history = drive(&protocol, |size| size <= 10);
        let sizes = history.iter().map(|r| r.size).collect::<Vec<_>>();
        assert_eq!(sizes, vec![1, 2, 6, 15, 7, 11, 8, 9, 10]);
        assert!(protocol.is_concluded(&history));
        assert_eq!(protocol.replay(&history).ceiling, Some(11));
    }

    #[test]
    fn accelerating_failure_after_a_single_step_counts() {
        let protocol = IterativeCapacity::new()
            .with_min_size(1)
            .with_exponent(2)
            .with_failure_streak(1);
        let history = drive(&protocol, |size| size <= 1);
        let sizes = history.iter().map(|r| r.size).collect::<Vec<_>>();
        assert_eq!(sizes, vec![1, 2]);

        let patient = protocol.with_failure_streak(2);
        assert_eq!(patient.next_size(&[ok(1), fail(2)]), Some(2));
        assert_eq!(patient.next_size(&[ok(1), fail(2), ok(2)]), Some(6));
    }

    #[test]
    fn accelerating_search_stops_at_max_size() {
        let protocol = IterativeCapacity::new()
            .with_min_size(1)
            .with_exponent(2)
            .with_max_size(20);
        let history = drive(&protocol, |_| true);
        let sizes = history.iter().map(|r| r.size).collect::<Vec<_>>();
        assert_eq!(sizes, vec![1, 2, 6, 15, 16, 20]);
    }

    #[test]
    fn recording_round_by_round_matches_replay() {
        let protocol = IterativeCapacity::new().with_failure_streak(1);
        let history = vec![ok(1), fail(2), ok(2), ok(3)];

        let mut replay = protocol.start();
        for round in &history {
            protocol.record(&mut replay, round);
        }
        assert_eq!(replay, protocol.replay(&history));
        assert!(replay.is_concluded());
        assert_eq!(replay.played(), 2);
    }

    #[test]
    fn long_histories_replay_in_one_pass() {
        let protocol = FixedSizeRepeated::new(1, 200_000);
        let history = vec![ok(1); 200_000];
        assert_eq!(protocol.concluded_at(&history), 200_000);
        assert!(protocol.is_concluded(&history));
    }

    #[test]
    fn fixed_size_counts_every_round() {
        let protocol = FixedSizeRepeated::new(7, 3);
        assert_eq!(protocol.first_size(), 7);
        let history = vec![crash(7), fail(7)];
        assert_eq!(protocol.next_size(&history), Some(7));
        let history = vec![crash(7), crash(7), crash(7)];
        assert!(protocol.is_concluded(&history));
    }

    #[test]
    fn validation() {
        assert!(ProtocolConfig::from(IterativeCapacity::new()).validate().is_ok());
        assert!(ProtocolConfig::from(IterativeCapacity::new().with_step(0))
            .validate()
            .is_err());
        assert!(ProtocolConfig::from(IterativeCapacity::new().with_failure_streak(0))
            .validate()
            .is_err());
        assert!(ProtocolConfig::from(IterativeCapacity::new().with_max_rounds(0))
            .validate()
            .is_err());
        assert!(ProtocolConfig::from(IterativeCapacity::new().with_exponent(0))
            .validate()
            .is_err());
        assert!(ProtocolConfig::from(IterativeCapacity::new().with_exponent(2))
            .validate()
            .is_ok());
        assert!(
            ProtocolConfig::from(IterativeCapacity::new().with_min_size(5).with_max_size(2))
                .validate()
                .is_err()
        );
        assert!(
            ProtocolConfig::from(IterativeCapacity::new().with_approximation_tolerance(0.5))
                .validate()
                .is_err()
        );
        assert!(ProtocolConfig::from(FixedSizeRepeated::new(3, 0))
            .validate()
            .is_err());
        assert!(ProtocolConfig::from(
            FixedSizeRepeated::new(3, 2).with_approximation_tolerance(f64::NAN)
        )
        .validate()
        .is_err());
    }

    #[test]
    fn resolve_uses_problem_min_size() {
        struct Big;
        impl Problem for Big {
            fn name(&self) -> &str {
                "big"
            }
            fn min_size(&self) -> u64 {
                8
            }
            fn validate_instance(&self, _: &[u8], _: u64) -> bool {
                true
            }
            fn validate_certificate(&self, _: &[u8], _: &[u8]) -> bool {
                true
            }
        }

        let config = ProtocolConfig::from(IterativeCapacity::new()).resolve(&Big);
        assert_eq!(config.first_size(), 8);
        let config = ProtocolConfig::from(IterativeCapacity::new().with_min_size(2)).resolve(&Big);
        assert_eq!(config.first_size(), 2);
    }
}

//! Turns battle histories into scores, and scores into tournament standings.
//!
//! Everything here is a pure function of its inputs: scoring the same history twice gives
//! the same [`BattleScore`], and standings can be recomputed with another [`Combination`]
//! from the reports of a finished tournament.

use std::{collections::HashMap, fmt, time::Duration};

use crate::{
    battle::BattleReport,
    protocol::{Protocol, ProtocolConfig},
    round::{RoundOutcome, Verdict},
};

/// What the score measures, depending on the protocol that produced the history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreKind {
    /// Largest size solved, `0` if none.
    Capacity(u64),
    /// Share of solver-attributed rounds solved.
    SuccessRate {
        /// Successes over solver-attributed rounds, `0.0` when there were none.
        rate: f64,
        /// Mean of `1 / approximation ratio` over solver-attributed rounds, failures
        /// counting as `0.0`.
        mean_inverse_ratio: f64,
    },
}

/// Why a score is zero for reasons other than an honest solver loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreFault {
    /// Nothing to report.
    None,
    /// The generator never produced a valid instance, so the solver was never tested.
    NoValidInstance,
    /// The solver ran at least once and never succeeded.
    SolverFailedAll,
}

/// Score of one battle, always credited to the solving team.
#[derive(Debug, Clone, PartialEq)]
pub struct BattleScore {
    /// Headline result.
    pub kind: ScoreKind,
    /// Rounds of the history taken into account.
    pub rounds: usize,
    /// Rounds lost to a generator timeout, crash or invalid instance.
    pub generator_faults: usize,
    /// Rounds where the solver was handed a valid instance.
    pub solver_rounds: usize,
    /// Solver-attributed rounds solved within tolerance.
    pub solver_successes: usize,
    /// Rounds interrupted by cancellation.
    pub cancelled_rounds: usize,
    /// Mean wall time of the solver over the rounds it ran.
    pub mean_solver_wall_time: Option<Duration>,
    /// Mean memory peak of the solver over the rounds it ran, in bytes.
    pub mean_solver_memory: Option<u64>,
    /// Classification of degenerate battles.
    pub fault: ScoreFault,
}

impl BattleScore {
    /// Single number used for standings: the capacity or the success rate.
    pub fn value(&self) -> f64 {
        match self.kind {
            ScoreKind::Capacity(capacity) => capacity as f64,
            ScoreKind::SuccessRate { rate, .. } => rate,
        }
    }

    /// Capacity of an iterative battle.
    pub fn capacity(&self) -> Option<u64> {
        match self.kind {
            ScoreKind::Capacity(capacity) => Some(capacity),
            ScoreKind::SuccessRate { .. } => None,
        }
    }
}

impl fmt::Display for BattleScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ScoreKind::Capacity(capacity) => write!(f, "capacity {capacity}")?,
            ScoreKind::SuccessRate { rate, .. } => write!(f, "{:.1}% solved", rate * 100.0)?,
        }
        match self.fault {
            ScoreFault::None => Ok(()),
            ScoreFault::NoValidInstance => write!(f, " (no valid instance)"),
            ScoreFault::SolverFailedAll => write!(f, " (solver failed all)"),
        }
    }
}

/// Scores `history` as played under `protocol`.
///
/// Only the rounds the protocol consumed before concluding are taken into account, so the
/// same recorded sequence can be rescored under other parameters.
pub fn score(history: &[RoundOutcome], protocol: &ProtocolConfig) -> BattleScore {
    let considered = &history[..protocol.concluded_at(history)];
    let tolerance = protocol.approximation_tolerance();

    let mut generator_faults = 0;
    let mut solver_rounds = 0;
    let mut solver_successes = 0;
    let mut cancelled_rounds = 0;
    let mut capacity = 0;
    let mut inverse_ratios = 0.0;
    for round in considered {
        match round.verdict(tolerance) {
            Verdict::Solved => {
                solver_rounds += 1;
                solver_successes += 1;
                capacity = capacity.max(round.size);
                inverse_ratios += 1.0 / round.approximation_ratio.unwrap_or(1.0);
            }
            Verdict::Failed => solver_rounds += 1,
            Verdict::GeneratorFault => generator_faults += 1,
            Verdict::Cancelled => cancelled_rounds += 1,
        }
    }

    let kind = match protocol {
        ProtocolConfig::IterativeCapacity(_) => ScoreKind::Capacity(capacity),
        ProtocolConfig::FixedSizeRepeated(_) => {
            let (rate, mean_inverse_ratio) = if solver_rounds == 0 {
                (0.0, 0.0)
            } else {
                let n = solver_rounds as f64;
                (solver_successes as f64 / n, inverse_ratios / n)
            };
            ScoreKind::SuccessRate {
                rate,
                mean_inverse_ratio,
            }
        }
    };

    let fault = if solver_rounds == 0 && generator_faults > 0 {
        ScoreFault::NoValidInstance
    } else if solver_rounds > 0 && solver_successes == 0 {
        ScoreFault::SolverFailedAll
    } else {
        ScoreFault::None
    };

    let usages = considered
        .iter()
        .filter(|round| round.verdict(tolerance) != Verdict::Cancelled)
        .filter_map(|round| round.solver_usage)
        .collect::<Vec<_>>();
    let (mean_solver_wall_time, mean_solver_memory) = match u32::try_from(usages.len()) {
        Ok(count) if count > 0 => (
            Some(usages.iter().map(|u| u.wall_time).sum::<Duration>() / count),
            Some(usages.iter().map(|u| u.memory_peak).sum::<u64>() / u64::from(count)),
        ),
        _ => (None, None),
    };

    BattleScore {
        kind,
        rounds: considered.len(),
        generator_faults,
        solver_rounds,
        solver_successes,
        cancelled_rounds,
        mean_solver_wall_time,
        mean_solver_memory,
        fault,
    }
}

/// Share of the pair's combined result earned by `a`, where `b` is the score of the opposite
/// direction. Both sides get `0.5` when neither scored.
pub fn normalized_capacity(a: &BattleScore, b: &BattleScore) -> f64 {
    proportional_share(a.value(), b.value())
}

fn proportional_share(a: f64, b: f64) -> f64 {
    if a + b <= 0.0 {
        0.5
    } else {
        a / (a + b)
    }
}

/// How per-battle scores are combined into one number per team.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Combination {
    /// Sum of the team's scores as solver.
    Sum,
    /// Mean of the team's scores as solver.
    Average,
    /// For every pair of distinct teams, split `achievable` points between both in proportion
    /// to their scores as solver against each other.
    PairwisePoints {
        /// Points distributed per pair.
        achievable: f64,
    },
}

/// Result of one team in [`Standings`].
#[derive(Debug, Clone, PartialEq)]
pub struct TeamStanding {
    /// Team name.
    pub team: String,
    /// Combined result.
    pub score: f64,
    /// Scored battles the team took part in as solver.
    pub battles: usize,
}

/// Teams ranked by combined score, best first, ties broken by name.
#[derive(Debug, Clone, PartialEq)]
pub struct Standings {
    /// One entry per team appearing in the reports.
    pub teams: Vec<TeamStanding>,
}

impl Standings {
    /// Combines the scored battles among `reports`. Unscored battles are ignored, but their
    /// teams still get an entry.
    pub fn from_reports(reports: &[BattleReport], combination: Combination) -> Standings {
        // (solver, generator) -> scores over repetitions
        let mut per_pair: HashMap<(&str, &str), Vec<f64>> = HashMap::new();
        let mut totals: HashMap<&str, (f64, usize)> = HashMap::new();
        for report in reports {
            let solver = report.id.solver.name.as_str();
            let generator = report.id.generator.name.as_str();
            totals.entry(solver).or_default();
            totals.entry(generator).or_default();
            if let Some(score) = &report.score {
                per_pair
                    .entry((solver, generator))
                    .or_default()
                    .push(score.value());
                let entry = totals.entry(solver).or_default();
                entry.0 += score.value();
                entry.1 += 1;
            }
        }

        let mut teams = match combination {
            Combination::Sum | Combination::Average => totals
                .iter()
                .map(|(&team, &(sum, battles))| TeamStanding {
                    team: team.to_string(),
                    score: match combination {
                        Combination::Average if battles > 0 => sum / battles as f64,
                        Combination::Average => 0.0,
                        _ => sum,
                    },
                    battles,
                })
                .collect::<Vec<_>>(),
            Combination::PairwisePoints { achievable } => {
                let names = {
                    let mut names = totals.keys().copied().collect::<Vec<_>>();
                    names.sort_unstable();
                    names
                };
                let mut points: HashMap<&str, f64> = names.iter().map(|&n| (n, 0.0)).collect();
                for (i, &a) in names.iter().enumerate() {
                    for &b in &names[i + 1..] {
                        // a pair is only rated once both directions were scored
                        let (Some(a_solves), Some(b_solves)) = (
                            mean(per_pair.get(&(a, b))),
                            mean(per_pair.get(&(b, a))),
                        ) else {
                            continue;
                        };
                        let share = proportional_share(a_solves, b_solves);
                        *points.entry(a).or_default() += achievable * share;
                        *points.entry(b).or_default() += achievable * (1.0 - share);
                    }
                }
                points
                    .into_iter()
                    .map(|(team, score)| TeamStanding {
                        team: team.to_string(),
                        score,
                        battles: totals.get(team).map_or(0, |t| t.1),
                    })
                    .collect()
            }
        };

        teams.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.team.cmp(&b.team)));
        Standings { teams }
    }

    /// Combined score of `team`.
    pub fn get(&self, team: &str) -> Option<f64> {
        self.teams.iter().find(|t| t.team == team).map(|t| t.score)
    }
}

fn mean(values: Option<&Vec<f64>>) -> Option<f64> {
    values
        .filter(|v| !v.is_empty())
        .map(|v| v.iter().sum::<f64>() / v.len() as f64)
}

impl fmt::Display for Standings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (rank, team) in self.teams.iter().enumerate() {
            writeln!(f, "{:>3}. {:<20} {:.3}", rank + 1, team.team, team.score)?;
        }
        Ok(())
    }
}

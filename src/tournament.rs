//! Entry point of a tournament run.
//!
//! A [`Tournament`] pits every team's generator against every other team's solver. Each
//! ordered pair of teams plays one battle (or several, see [`Tournament::with_repetitions`]),
//! and every battle is reported exactly once in the returned [`TournamentReport`], whatever
//! happened to it.
//!
//! # Behavior & Configuration
//!
//! Resource limits come from [`Constraints`]: per program limits, how many programs run at
//! once, and the battle and tournament deadlines. Behavior is controlled by a
//! [`Configuration`]:
//!
//! - `verbose` prints battles as they run and finish.
//! - `log` writes every event to a timestamped log file.
//! - `allow_uncontained` lets the default [`ProcessSandbox`] run programs without cgroups.
//!   In this case, **only time and memory sampling are enforced**, and CPU pinning is skipped.
//!
//! # Errors
//!
//! Before anything runs, the tournament is checked: at least one team, unique team names,
//! valid protocol parameters and existing program artifacts. Any problem aborts the whole
//! run. Once battles are scheduled, failures only ever affect the battle they happen in.
//!
//! # Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use battle_engine::prelude::*;
//!
//! struct Sorting;
//!
//! impl Problem for Sorting {
//!     fn name(&self) -> &str {
//!         "sorting"
//!     }
//!     fn validate_instance(&self, instance: &[u8], size: u64) -> bool {
//!         instance.len() as u64 <= size
//!     }
//!     fn validate_certificate(&self, instance: &[u8], certificate: &[u8]) -> bool {
//!         let mut sorted = instance.to_vec();
//!         sorted.sort_unstable();
//!         sorted == certificate
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let teams = vec![
//!         Team::new("red", Program::new("./red/generator"), Program::new("./red/solver")),
//!         Team::new("blue", Program::new("./blue/generator"), Program::new("./blue/solver")),
//!     ];
//!     let constraints = ConstraintsBuilder::new()
//!         .with_solver_timeout(Duration::from_secs(2))
//!         .with_generator_timeout(Duration::from_secs(2))
//!         .with_battle_deadline(Duration::from_secs(300))
//!         .build()?;
//!     let protocol = IterativeCapacity::new().with_step(10).with_failure_streak(3);
//!
//!     let report = Tournament::new(Arc::new(Sorting), protocol, constraints, Configuration::new())
//!         .run(&teams)?;
//!     println!("{}", report.standings(Combination::Sum));
//!     Ok(())
//! }
//! ```

use std::{
    collections::HashSet,
    sync::{mpsc::Sender, Arc},
};

use anyhow::{bail, Context};
use tracing::{info, instrument, trace, warn};

use crate::{
    battle::{BattleId, BattleReport, BattleStatus},
    cancellation::Cancellation,
    configuration::Configuration,
    constraints::Constraints,
    logger::init_logger,
    problem::Problem,
    progress::ProgressEvent,
    protocol::ProtocolConfig,
    sandbox::{ProcessSandbox, Sandbox},
    scoring::{BattleScore, Combination, Standings},
    team::Team,
    tournament_scheduler::TournamentScheduler,
};

/// A battle that could not be scored because the engine itself failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfrastructureFailure {
    /// Battle concerned.
    pub battle: BattleId,
    /// Description of the error, with its causes.
    pub error: String,
}

/// Outcome of a tournament run.
#[derive(Debug, Clone)]
pub struct TournamentReport {
    /// One report per scheduled battle, in completion order.
    pub reports: Vec<BattleReport>,
    /// Battles stopped by an infrastructure error, also present in `reports`.
    pub infrastructure_failures: Vec<InfrastructureFailure>,
}

impl TournamentReport {
    fn new(reports: Vec<BattleReport>) -> TournamentReport {
        let infrastructure_failures = reports
            .iter()
            .filter_map(|report| match &report.status {
                BattleStatus::Failed { error } => Some(InfrastructureFailure {
                    battle: report.id.clone(),
                    error: error.clone(),
                }),
                _ => None,
            })
            .collect();
        TournamentReport {
            reports,
            infrastructure_failures,
        }
    }

    /// Scores of every scored battle.
    pub fn scores(&self) -> impl Iterator<Item = (&BattleId, &BattleScore)> {
        self.reports
            .iter()
            .filter_map(|report| report.score.as_ref().map(|score| (&report.id, score)))
    }

    /// Report of the battle between `generator` and `solver` (first repetition).
    pub fn battle(&self, generator: &str, solver: &str) -> Option<&BattleReport> {
        self.reports.iter().find(|report| {
            report.id.generator.name == generator
                && report.id.solver.name == solver
                && report.id.repetition == 0
        })
    }

    /// Team standings under `combination`.
    pub fn standings(&self, combination: Combination) -> Standings {
        Standings::from_reports(&self.reports, combination)
    }
}

/// Cancels a running tournament from another thread.
#[derive(Debug, Clone)]
pub struct TournamentHandle {
    cancellation: Cancellation,
}

impl TournamentHandle {
    /// Stops every running program and battle. Battles not yet concluded are reported as
    /// cancelled. Cancelling is permanent for the [`Tournament`] it came from.
    pub fn cancel(&self) {
        info!("tournament cancellation requested");
        self.cancellation.cancel();
    }
}

/// A configured tournament, ready to run.
pub struct Tournament {
    problem: Arc<dyn Problem>,
    protocol: ProtocolConfig,
    constraints: Constraints,
    config: Configuration,
    sandbox: Arc<dyn Sandbox>,
    progress: Option<Sender<ProgressEvent>>,
    repetitions: usize,
    cancellation: Cancellation,
}

impl Tournament {
    /// A tournament running programs in a [`ProcessSandbox`], one battle per ordered pair.
    pub fn new(
        problem: Arc<dyn Problem>,
        protocol: impl Into<ProtocolConfig>,
        constraints: Constraints,
        config: Configuration,
    ) -> Tournament {
        trace!(?config, ?constraints);
        Tournament {
            problem,
            protocol: protocol.into(),
            constraints,
            config,
            sandbox: Arc::new(ProcessSandbox::new(config)),
            progress: None,
            repetitions: 1,
            cancellation: Cancellation::new(),
        }
    }

    /// Runs programs through `sandbox` instead of the default [`ProcessSandbox`].
    pub fn with_sandbox(self, sandbox: impl Sandbox + 'static) -> Self {
        Self {
            sandbox: Arc::new(sandbox),
            ..self
        }
    }

    /// Streams [`ProgressEvent`]s to `tx` while running.
    pub fn with_progress(self, tx: Sender<ProgressEvent>) -> Self {
        Self {
            progress: Some(tx),
            ..self
        }
    }

    /// Number of battles played by each ordered pair, each with its own seeds.
    pub fn with_repetitions(self, repetitions: usize) -> Self {
        Self {
            repetitions,
            ..self
        }
    }

    /// Handle to cancel [`run`](Self::run) from another thread.
    pub fn handle(&self) -> TournamentHandle {
        TournamentHandle {
            cancellation: self.cancellation.clone(),
        }
    }

    /// Checks everything that can be checked before any battle is scheduled.
    fn preflight(&self, teams: &[Arc<Team>]) -> anyhow::Result<()> {
        if teams.is_empty() {
            bail!("no team to run a tournament with");
        }
        if self.repetitions == 0 {
            bail!("each pair must play at least one battle");
        }
        let mut names = HashSet::new();
        for team in teams {
            if !names.insert(team.name.as_str()) {
                bail!("team name '{}' is used twice", team.name);
            }
        }
        self.protocol
            .validate()
            .context("invalid protocol parameters")?;
        for team in teams {
            for (role, program) in [("generator", &team.generator), ("solver", &team.solver)] {
                self.sandbox
                    .check_program(program)
                    .with_context(|| format!("{role} of team '{}' cannot be run", team.name))?;
            }
        }
        Ok(())
    }

    /// Every ordered pair of distinct teams, `repetitions` times. A lone team battles itself.
    fn battles(&self, teams: &[Arc<Team>]) -> Vec<BattleId> {
        let mut battles = vec![];
        for generator in teams {
            for solver in teams {
                if generator == solver && teams.len() > 1 {
                    continue;
                }
                for repetition in 0..self.repetitions {
                    battles.push(BattleId {
                        generator: generator.clone(),
                        solver: solver.clone(),
                        repetition,
                    });
                }
            }
        }
        battles
    }

    /// Runs every battle of `teams` and reports all of them.
    ///
    /// # Errors
    /// Configuration errors only (see the [module documentation](self)); nothing has been run
    /// when one is returned.
    #[instrument(skip_all, fields(problem = self.problem.name()))]
    pub fn run(&self, teams: &[Arc<Team>]) -> anyhow::Result<TournamentReport> {
        if self.config.log && !tracing::dispatcher::has_been_set() {
            init_logger().context("could not set up logging")?;
        }
        self.preflight(teams)?;

        let protocol = self.protocol.resolve(self.problem.as_ref());
        let battles = self.battles(teams);
        info!(teams = teams.len(), battles = battles.len(), ?protocol, "tournament started");

        let root = self.cancellation.child(self.constraints.tournament_deadline());
        let scheduler = TournamentScheduler::new(
            self.problem.as_ref(),
            &protocol,
            self.sandbox.clone(),
            &self.constraints,
            self.config,
            battles,
        );

        if self.config.verbose {
            disable_line_wrap();
        }
        let reports = scheduler.run(&root, self.progress.as_ref());
        if self.config.verbose {
            enable_line_wrap();
        }

        let report = TournamentReport::new(reports);
        if !report.infrastructure_failures.is_empty() {
            warn!(
                failures = report.infrastructure_failures.len(),
                "some battles could not be scored"
            );
        }
        info!(battles = report.reports.len(), "tournament finished");
        Ok(report)
    }
}

/// Runs a tournament with the default [`ProcessSandbox`] and a [`Configuration`] read from
/// the environment.
///
/// # Errors
/// See [`Tournament::run`].
pub fn run_tournament(
    teams: &[Arc<Team>],
    problem: Arc<dyn Problem>,
    protocol: impl Into<ProtocolConfig>,
    constraints: Constraints,
) -> anyhow::Result<TournamentReport> {
    Tournament::new(problem, protocol, constraints, Configuration::from_env()).run(teams)
}

fn disable_line_wrap() {
    print!("\x1b[?7l");
}

fn enable_line_wrap() {
    print!("\x1b[?7h");
}

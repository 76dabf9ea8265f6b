//! Defines resource constraints for generator and solver execution.
//!
//! This module provides tools to configure the per-program limits applied to every sandboxed
//! invocation, and the global resource budget shared by all concurrently running battles.
//!
//! # Overview
//!
//! The main entry point is the [`ConstraintsBuilder`] struct, which uses a builder pattern
//! to configure limits. These include:
//!
//! - **Memory constraints**: max total RAM, and RAM per generator / solver run
//! - **CPU constraints**: total CPU count, CPU affinity via list/range, CPUs per program
//! - **Timing constraints**:
//!   * Wall-clock and CPU time per generator / solver run
//!   * Overall deadline per battle and per tournament run
//! - **Concurrency**: maximum number of sandboxed programs running at once
//!
//! Every sandboxed run takes a slot out of the budget (its CPUs plus its memory limit) and
//! gives it back when it ends, so the host is never oversubscribed.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use battle_engine::constraints::ConstraintsBuilder;
//!
//! let constraints = ConstraintsBuilder::new()
//!     .with_max_total_ram(16_000)
//!     .with_generator_ram(1_000)
//!     .with_solver_ram(2_000)
//!     .with_cpu_list("0-3")
//!     .with_generator_timeout(Duration::from_secs(5))
//!     .with_solver_timeout(Duration::from_secs(10))
//!     .with_battle_deadline(Duration::from_secs(600))
//!     .build()
//!     .unwrap();
//! ```
//!
//! You may also construct constraints from environment variables using
//! [`ConstraintsBuilder::from_env()`] for runtime configurability.

use std::{collections::HashSet, env, time::Duration};

use anyhow::{bail, Context};
use tracing::warn;

#[derive(Debug, Default)]
enum AutoCpus {
    #[default]
    Auto,
    Count(usize),
    List(String),
}

/// Limits applied to a single sandboxed program invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    /// Maximum CPU time the program may consume.
    pub cpu_time: Duration,
    /// Maximum wall-clock time before the program is killed.
    pub wall_time: Duration,
    /// Maximum memory in bytes.
    pub memory: usize,
}

impl RunLimits {
    /// Limits that never trigger.
    pub fn unlimited() -> Self {
        Self {
            cpu_time: Duration::MAX,
            wall_time: Duration::MAX,
            memory: usize::MAX,
        }
    }
}

/// Limits used for both sides of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchLimits {
    /// Applied to every generator run.
    pub generator: RunLimits,
    /// Applied to every solver run.
    pub solver: RunLimits,
}

/// A builder for defining resource constraints for a tournament run.
///
/// By default, all constraints are unlimited, except for the total CPU count, which defaults
/// to the number of physical CPUs on the host machine, the total RAM, which defaults to the
/// available memory, and one CPU per program.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use battle_engine::constraints::ConstraintsBuilder;
///
/// let constraints = ConstraintsBuilder::new()
///     .with_max_total_ram(16_000)
///     .with_solver_ram(2_000)
///     .with_cpu_list("0-3,6")
///     .with_cpus_per_program(2)
///     .with_solver_timeout(Duration::from_millis(500))
///     .build();
/// ```
#[derive(Debug, Default)]
pub struct ConstraintsBuilder {
    total_ram: Option<usize>,
    generator_ram: Option<usize>,
    solver_ram: Option<usize>,
    cpus: AutoCpus,
    cpus_per_program: Option<usize>,
    generator_time: Option<Duration>,
    solver_time: Option<Duration>,
    generator_cpu_time: Option<Duration>,
    solver_cpu_time: Option<Duration>,
    max_parallel_runs: Option<usize>,
    battle_deadline: Option<Duration>,
    tournament_deadline: Option<Duration>,
}

impl ConstraintsBuilder {
    /// Creates a new `ConstraintsBuilder` with no limits except for the defaults described
    /// on the type.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new `ConstraintsBuilder` configured from environment variables.
    ///
    /// Read environment variables are:
    /// - `MAX_TOTAL_RAM` (usize): maximum total RAM in MB
    /// - `GENERATOR_RAM` (usize): maximum RAM per generator run in MB
    /// - `SOLVER_RAM` (usize): maximum RAM per solver run in MB
    /// - `CPU_LIST` (string): comma-separated list or ranges of CPUs, e.g. "0-3,6"
    /// - `TOTAL_CPU_COUNT` (usize): total number of CPUs allowed, overridden by `CPU_LIST`
    /// - `CPUS_PER_PROGRAM` (usize): number of CPUs allowed per program
    /// - `GENERATOR_TIMEOUT_MS` (u64): wall time per generator run in milliseconds
    /// - `SOLVER_TIMEOUT_MS` (u64): wall time per solver run in milliseconds
    /// - `GENERATOR_CPU_TIME_MS` (u64): cpu time per generator run in milliseconds
    /// - `SOLVER_CPU_TIME_MS` (u64): cpu time per solver run in milliseconds
    /// - `MAX_PARALLEL_RUNS` (usize): maximum number of programs running at once
    /// - `BATTLE_DEADLINE_SECS` (u64): overall deadline per battle in seconds
    /// - `TOURNAMENT_DEADLINE_SECS` (u64): overall deadline of the run in seconds
    #[must_use]
    pub fn from_env() -> Self {
        fn parse_usize(var: &str) -> Option<usize> {
            env::var(var).ok()?.parse().ok()
        }

        fn parse_duration_secs(var: &str) -> Option<Duration> {
            env::var(var)
                .ok()?
                .parse::<u64>()
                .ok()
                .map(Duration::from_secs)
        }

        fn parse_duration_millis(var: &str) -> Option<Duration> {
            env::var(var)
                .ok()?
                .parse::<u64>()
                .ok()
                .map(Duration::from_millis)
        }

        let cpu_list = env::var("CPU_LIST").ok();
        let total_cpu_count = parse_usize("TOTAL_CPU_COUNT");

        let cpus = if let Some(cpus_str) = cpu_list {
            AutoCpus::List(cpus_str)
        } else if let Some(count) = total_cpu_count {
            AutoCpus::Count(count)
        } else {
            AutoCpus::Auto
        };

        ConstraintsBuilder {
            total_ram: parse_usize("MAX_TOTAL_RAM"),
            generator_ram: parse_usize("GENERATOR_RAM"),
            solver_ram: parse_usize("SOLVER_RAM"),
            cpus,
            cpus_per_program: parse_usize("CPUS_PER_PROGRAM"),
            generator_time: parse_duration_millis("GENERATOR_TIMEOUT_MS"),
            solver_time: parse_duration_millis("SOLVER_TIMEOUT_MS"),
            generator_cpu_time: parse_duration_millis("GENERATOR_CPU_TIME_MS"),
            solver_cpu_time: parse_duration_millis("SOLVER_CPU_TIME_MS"),
            max_parallel_runs: parse_usize("MAX_PARALLEL_RUNS"),
            battle_deadline: parse_duration_secs("BATTLE_DEADLINE_SECS"),
            tournament_deadline: parse_duration_secs("TOURNAMENT_DEADLINE_SECS"),
        }
    }

    /// Sets the maximum total RAM available across all running programs (in MB).
    #[must_use]
    pub fn with_max_total_ram(self, max: usize) -> Self {
        Self {
            total_ram: Some(max),
            ..self
        }
    }

    /// Sets the maximum RAM available to each generator run (in MB).
    #[must_use]
    pub fn with_generator_ram(self, max: usize) -> Self {
        Self {
            generator_ram: Some(max),
            ..self
        }
    }

    /// Sets the maximum RAM available to each solver run (in MB).
    #[must_use]
    pub fn with_solver_ram(self, max: usize) -> Self {
        Self {
            solver_ram: Some(max),
            ..self
        }
    }

    /// Sets the specific CPUs available for programs using a CPU list string.
    ///
    /// Format follows the pattern: `"0-3,6,8"` (inclusive ranges and individual IDs).
    #[must_use]
    pub fn with_cpu_list(self, cpus: &str) -> Self {
        Self {
            cpus: AutoCpus::List(cpus.to_string()),
            ..self
        }
    }

    /// Sets the total number of logical CPUs available across all programs.
    ///
    /// This will be ignored if `with_cpu_list` is also specified.
    #[must_use]
    pub fn with_total_cpu_count(self, max: usize) -> Self {
        if let AutoCpus::List(_) = self.cpus {
            warn!("`with_total_cpu_count` is ignored if `with_cpu_list` is used!");
            self
        } else {
            Self {
                cpus: AutoCpus::Count(max),
                ..self
            }
        }
    }

    /// Sets the number of logical CPUs pinned to each running program.
    ///
    /// Default is one
    #[must_use]
    pub fn with_cpus_per_program(self, max: usize) -> Self {
        Self {
            cpus_per_program: Some(max),
            ..self
        }
    }

    /// Sets the wall-clock timeout of a single generator run.
    #[must_use]
    pub fn with_generator_timeout(self, duration: Duration) -> Self {
        Self {
            generator_time: Some(duration),
            ..self
        }
    }

    /// Sets the wall-clock timeout of a single solver run.
    #[must_use]
    pub fn with_solver_timeout(self, duration: Duration) -> Self {
        Self {
            solver_time: Some(duration),
            ..self
        }
    }

    /// Sets the CPU time limit of a single generator run.
    #[must_use]
    pub fn with_generator_cpu_time(self, duration: Duration) -> Self {
        Self {
            generator_cpu_time: Some(duration),
            ..self
        }
    }

    /// Sets the CPU time limit of a single solver run.
    #[must_use]
    pub fn with_solver_cpu_time(self, duration: Duration) -> Self {
        Self {
            solver_cpu_time: Some(duration),
            ..self
        }
    }

    /// Caps the number of sandboxed programs running at the same time.
    ///
    /// Without this, the cap is the number of CPUs divided by the CPUs per program.
    #[must_use]
    pub fn with_max_parallel_runs(self, max: usize) -> Self {
        Self {
            max_parallel_runs: Some(max),
            ..self
        }
    }

    /// Sets the overall deadline of a single battle, counted from its first round.
    #[must_use]
    pub fn with_battle_deadline(self, duration: Duration) -> Self {
        Self {
            battle_deadline: Some(duration),
            ..self
        }
    }

    /// Sets the overall deadline of the whole tournament run.
    #[must_use]
    pub fn with_tournament_deadline(self, duration: Duration) -> Self {
        Self {
            tournament_deadline: Some(duration),
            ..self
        }
    }

    /// Consumes the builder and returns the constructed `Constraints`.
    ///
    /// # Errors
    ///
    /// Returns an error when the constraints are impossible, e.g. solver RAM greater than the
    /// total RAM, or more CPUs per program than CPUs available.
    pub fn build(self) -> anyhow::Result<Constraints> {
        let mut sys = sysinfo::System::new();

        let total_ram = self.total_ram.map(|i| i * 1_000_000).unwrap_or_else(|| {
            sys.refresh_memory();
            sys.available_memory() as usize
        });

        // By default, we use the physical CPU count because using all logical CPUs
        // cuts program performance in half on hyperthreaded hosts.
        let cpus = match self.cpus {
            AutoCpus::Auto => {
                let num_cpus = num_cpus::get_physical().min(u8::MAX as usize) as u8;
                (0..num_cpus).collect::<HashSet<u8>>()
            }
            AutoCpus::Count(num_cpus) => {
                (0..(num_cpus.min(u8::MAX as usize) as u8)).collect::<HashSet<u8>>()
            }
            AutoCpus::List(s) => {
                cpu_list_to_hashset(&s).map_err(|e| e.context("error parsing cpu list"))?
            }
        };
        if cpus.is_empty() {
            bail!("no CPU available for running programs");
        }

        let cpus_per_program = self.cpus_per_program.unwrap_or(1);
        if cpus_per_program == 0 {
            bail!("each program needs at least one CPU");
        }
        if cpus_per_program > cpus.len() {
            bail!(
                "{cpus_per_program} CPUs per program requested but only {} CPUs are available",
                cpus.len()
            );
        }

        let slots_by_cpu = cpus.len() / cpus_per_program;
        let default_ram = total_ram / slots_by_cpu;
        let generator_ram = self.generator_ram.map(|i| i * 1_000_000).unwrap_or(default_ram);
        let solver_ram = self.solver_ram.map(|i| i * 1_000_000).unwrap_or(default_ram);

        for (role, ram) in [("Generator", generator_ram), ("Solver", solver_ram)] {
            if ram > total_ram {
                bail!(
                    "{role} RAM size ({}MB) is greater than total RAM ({}MB)",
                    ram / 1_000_000,
                    total_ram / 1_000_000
                );
            }
        }

        let max_parallel_runs = match self.max_parallel_runs {
            Some(0) => bail!("at least one program must be allowed to run at a time"),
            Some(max) => max.min(slots_by_cpu),
            None => slots_by_cpu,
        };

        for (name, deadline) in [
            ("battle", self.battle_deadline),
            ("tournament", self.tournament_deadline),
        ] {
            if deadline == Some(Duration::ZERO) {
                bail!("{name} deadline must not be zero");
            }
        }

        Ok(Constraints {
            budget: Budget {
                ram: total_ram,
                cpus,
            },
            cpus_per_program,
            limits: MatchLimits {
                generator: RunLimits {
                    cpu_time: self.generator_cpu_time.unwrap_or(Duration::MAX),
                    wall_time: self.generator_time.unwrap_or(Duration::MAX),
                    memory: generator_ram,
                },
                solver: RunLimits {
                    cpu_time: self.solver_cpu_time.unwrap_or(Duration::MAX),
                    wall_time: self.solver_time.unwrap_or(Duration::MAX),
                    memory: solver_ram,
                },
            },
            max_parallel_runs,
            battle_deadline: self.battle_deadline,
            tournament_deadline: self.tournament_deadline,
        })
    }
}

fn cpu_list_to_hashset(s: &str) -> anyhow::Result<HashSet<u8>> {
    if s.is_empty() {
        bail!("Empty string");
    }
    let mut set: HashSet<u8> = HashSet::new();
    for item in s.split(',') {
        let bounds = item.split('-').map(str::trim).collect::<Vec<_>>();
        match bounds.as_slice() {
            [value] => {
                let value: u8 = value
                    .parse()
                    .with_context(|| format!("could not parse {value}"))?;
                set.insert(value);
            }
            [start, end] => {
                let start: u8 = start
                    .parse()
                    .with_context(|| format!("could not parse {start}"))?;
                let end: u8 = end
                    .parse()
                    .with_context(|| format!("could not parse {end}"))?;
                let range = if start <= end {
                    start..=end
                } else {
                    end..=start
                };
                set.extend(range);
            }
            _ => bail!(
                "each comma-separated item must be a number or a range (e.g. '0-3'), got '{item}'"
            ),
        }
    }
    Ok(set)
}

/// CPUs and RAM (in bytes) handed out to running programs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Budget {
    pub(crate) ram: usize,
    pub(crate) cpus: HashSet<u8>,
}

/// The share of the budget held by one running program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Slot {
    pub(crate) ram: usize,
    pub(crate) cpus: HashSet<u8>,
}

impl Budget {
    pub(crate) fn add(&mut self, slot: Slot) {
        self.ram += slot.ram;
        self.cpus.extend(slot.cpus);
    }

    pub(crate) fn try_take(&mut self, num_cpus: usize, ram: usize) -> Option<Slot> {
        if self.cpus.len() < num_cpus || self.ram < ram {
            return None;
        }
        let mut taken = self.cpus.iter().copied().collect::<Vec<_>>();
        taken.sort_unstable();
        taken.truncate(num_cpus);
        for cpu in &taken {
            self.cpus.remove(cpu);
        }
        self.ram -= ram;
        Some(Slot {
            ram,
            cpus: taken.into_iter().collect(),
        })
    }
}

/// Obtained using `ConstraintsBuilder`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Constraints {
    pub(crate) budget: Budget,
    pub(crate) cpus_per_program: usize,
    pub(crate) limits: MatchLimits,
    pub(crate) max_parallel_runs: usize,
    pub(crate) battle_deadline: Option<Duration>,
    pub(crate) tournament_deadline: Option<Duration>,
}

impl Constraints {
    /// create a ConstraintsBuilder
    pub fn builder() -> ConstraintsBuilder {
        ConstraintsBuilder::new()
    }

    /// Per-program limits of generator and solver runs.
    pub fn limits(&self) -> MatchLimits {
        self.limits
    }

    /// Maximum number of sandboxed programs running at the same time.
    pub fn max_parallel_runs(&self) -> usize {
        self.max_parallel_runs
    }

    /// Overall deadline of a single battle, if any.
    pub fn battle_deadline(&self) -> Option<Duration> {
        self.battle_deadline
    }

    /// Overall deadline of the tournament run, if any.
    pub fn tournament_deadline(&self) -> Option<Duration> {
        self.tournament_deadline
    }
}

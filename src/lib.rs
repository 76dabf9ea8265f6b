//! # Battle Engine
//!
//! Judges competitions between teams' programs. Every team ships a *generator*, producing a
//! problem instance of a requested size, and a *solver*, solving instances produced by the
//! other teams. A *battle* sets one team's generator against another team's solver for as
//! many rounds as its protocol asks for, and scores the solver.
//!
//! It provides:
//! - Tournament execution over every ordered pair of teams ([`Tournament`](crate::tournament::Tournament))
//! - Battle protocols via [`ProtocolConfig`](crate::protocol::ProtocolConfig):
//!   [`IterativeCapacity`](crate::protocol::IterativeCapacity) and
//!   [`FixedSizeRepeated`](crate::protocol::FixedSizeRepeated)
//! - Pure scoring of battle histories and tournament [`Standings`](crate::scoring::Standings)
//! - Resource constraints enforced through Linux cgroups v2, and a global budget bounding how
//!   many programs run at once
//!
//! Each program runs as a separate OS process. Process-level isolation applies constraints
//! such as CPU affinity, memory limits, and timeouts.
//!
//! # Documentation Overview
//!
//! - For running a tournament and reading its results, see the [`tournament`] module.
//! - For configuring behavior, resource limits, and the execution environment,
//!   see [`Configuration`](crate::configuration::Configuration) and [`constraints`].
//! - For defining the problem teams fight over, see the [`Problem`](crate::problem::Problem) trait.
//! - For plugging another isolation mechanism, see the [`Sandbox`](crate::sandbox::Sandbox) trait.
//!
//! # Program Requirements
//!
//! - The generator is called with the instance size and a seed as its last two arguments and
//!   must write the instance to stdout.
//! - The solver is called with the instance size as its last argument, reads the instance on
//!   stdin, and must write its certificate to stdout.
//! - Both must exit with status `0` within their limits.
#![warn(missing_docs)]

mod cgroup_manager;
pub use anyhow;
pub mod battle;
pub mod cancellation;
pub mod configuration;
pub mod constraints;
mod logger;
pub mod match_executor;
pub mod problem;
pub mod progress;
pub mod protocol;
mod resource_pool;
pub mod round;
pub mod sandbox;
pub mod scoring;
pub mod team;
pub mod tournament;
mod tournament_scheduler;

/// Commonly used types and traits for quick access.
///
/// Import this prelude to get started easily:
/// ```rust
/// use battle_engine::prelude::*;
/// ```
///
/// Includes:
/// - [`Configuration`](crate::configuration::Configuration)
/// - [`ConstraintsBuilder`](crate::constraints::ConstraintsBuilder)
/// - [`Tournament`](crate::tournament::Tournament) and [`run_tournament`](crate::tournament::run_tournament)
/// - the [`Problem`](crate::problem::Problem) trait, [`Team`](crate::team::Team) and [`Program`](crate::team::Program)
/// - both protocols and the standings [`Combination`](crate::scoring::Combination)
pub mod prelude {
    pub use crate::configuration::Configuration;
    pub use crate::constraints::ConstraintsBuilder;
    pub use crate::problem::Problem;
    pub use crate::protocol::{FixedSizeRepeated, IterativeCapacity, ProtocolConfig};
    pub use crate::scoring::Combination;
    pub use crate::team::{Program, Team};
    pub use crate::tournament::{run_tournament, Tournament};
}

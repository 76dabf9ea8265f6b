//! Contract between the battle engine and the facility that actually runs team programs.
//!
//! The engine only needs one operation: run a program with some arguments and stdin under
//! [`RunLimits`], and report how it ended. Every expected program failure (timeout, crash,
//! resource-limit kill) is reported inside a [`SandboxOutput`]. An `Err` means the sandbox
//! itself failed (e.g. the process could not be spawned) and is treated as an
//! infrastructure error by the scheduler.
//!
//! [`ProcessSandbox`] runs programs as local processes confined by cgroups.

use std::{collections::HashSet, time::Duration};

use crate::{cancellation::Cancellation, constraints::RunLimits, team::Program};

mod budgeted;
mod process;

pub(crate) use budgeted::BudgetedSandbox;
pub use process::ProcessSandbox;

/// A single program invocation.
#[derive(Debug, Clone)]
pub struct SandboxRequest<'a> {
    /// The artifact to run.
    pub program: &'a Program,
    /// Arguments appended after the program's own leading arguments.
    pub args: Vec<String>,
    /// Bytes written to the program's stdin, which is then closed.
    pub stdin: Vec<u8>,
    /// Limits enforced on this run.
    pub limits: RunLimits,
    /// CPUs the program is pinned to. Empty means no pinning.
    pub cpus: HashSet<u8>,
}

/// Which limit a run was killed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    /// Wall-clock time.
    WallTime,
    /// CPU time.
    CpuTime,
    /// Memory.
    Memory,
}

/// How a program run ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxOutput {
    /// Exit code, `None` if the program was killed by a signal.
    pub exit_status: Option<i32>,
    /// Captured stdout.
    pub stdout: Vec<u8>,
    /// Captured stderr.
    pub stderr: Vec<u8>,
    /// Wall-clock time from spawn to exit.
    pub wall_time: Duration,
    /// CPU time consumed, as far as it could be measured.
    pub cpu_time: Duration,
    /// Highest memory usage observed, in bytes.
    pub memory_peak: u64,
    /// Set when the sandbox killed the program for exceeding a limit.
    pub limit_hit: Option<LimitKind>,
    /// Set when the run was stopped because its cancellation signal fired.
    pub cancelled: bool,
}

impl SandboxOutput {
    /// True if the sandbox killed the program for exceeding a limit.
    pub fn killed_by_limit(&self) -> bool {
        self.limit_hit.is_some()
    }

    /// True if the program exited normally with code zero.
    pub fn success(&self) -> bool {
        self.exit_status == Some(0) && self.limit_hit.is_none() && !self.cancelled
    }
}

/// Executes one program under limits.
///
/// Must be safe to invoke concurrently: no mutable state may be shared between invocations.
pub trait Sandbox: Send + Sync {
    /// Run the request to completion, a limit kill, or cancellation.
    ///
    /// # Errors
    /// Only when the sandbox could not do its job (spawn failure, lost child...). Program
    /// failures are reported in the returned [`SandboxOutput`].
    fn run(
        &self,
        request: SandboxRequest<'_>,
        cancellation: &Cancellation,
    ) -> anyhow::Result<SandboxOutput>;

    /// Check that `program` can be run at all. Called once per artifact before any battle
    /// starts.
    fn check_program(&self, _program: &Program) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<S: Sandbox + ?Sized> Sandbox for std::sync::Arc<S> {
    fn run(
        &self,
        request: SandboxRequest<'_>,
        cancellation: &Cancellation,
    ) -> anyhow::Result<SandboxOutput> {
        (**self).run(request, cancellation)
    }

    fn check_program(&self, program: &Program) -> anyhow::Result<()> {
        (**self).check_program(program)
    }
}

//! Recorded result of a single generator-then-solver round.

use std::{fmt, time::Duration};

use crate::sandbox::SandboxOutput;

/// How the generator side of a round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorResult {
    /// A well-formed instance was produced.
    Ok,
    /// Killed for exceeding its wall or CPU time.
    Timeout,
    /// Nonzero exit, signal death or memory limit kill.
    Crash,
    /// Exited cleanly but its output is not a valid instance.
    InvalidInstance,
    /// Stopped because the battle or tournament was cancelled.
    Cancelled,
}

/// How the solver side of a round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverResult {
    /// A certificate that solves the instance was produced.
    Ok,
    /// Killed for exceeding its wall or CPU time.
    Timeout,
    /// Nonzero exit, signal death or memory limit kill.
    Crash,
    /// Exited cleanly but its output does not solve the instance.
    InvalidCertificate,
    /// Stopped because the battle or tournament was cancelled.
    Cancelled,
}

/// Resources consumed by one program run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    /// Wall-clock time.
    pub wall_time: Duration,
    /// CPU time.
    pub cpu_time: Duration,
    /// Peak memory, in bytes.
    pub memory_peak: u64,
}

impl From<&SandboxOutput> for Usage {
    fn from(output: &SandboxOutput) -> Self {
        Usage {
            wall_time: output.wall_time,
            cpu_time: output.cpu_time,
            memory_peak: output.memory_peak,
        }
    }
}

/// Who a round is attributed to, once a quality tolerance is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The generator failed; the round does not count for or against the solver.
    GeneratorFault,
    /// The round was interrupted; it counts for nobody.
    Cancelled,
    /// The solver solved the instance within tolerance.
    Solved,
    /// The solver failed or exceeded the tolerated approximation ratio.
    Failed,
}

/// Immutable record of one round, appended to a battle's history.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundOutcome {
    /// Position in the battle, starting at 0.
    pub index: usize,
    /// Requested instance size.
    pub size: u64,
    /// Seed handed to the generator.
    pub seed: u64,
    /// Generator side.
    pub generator: GeneratorResult,
    /// Resources used by the generator.
    pub generator_usage: Usage,
    /// Solver side, `None` when no valid instance existed to solve.
    pub solver: Option<SolverResult>,
    /// Resources used by the solver, if it ran.
    pub solver_usage: Option<Usage>,
    /// Approximation ratio of a valid certificate (`1.0` is optimal).
    pub approximation_ratio: Option<f64>,
    /// Generated instance, kept only for audit.
    pub instance: Option<Vec<u8>>,
    /// Solver certificate, kept only for audit.
    pub certificate: Option<Vec<u8>>,
}

impl RoundOutcome {
    /// Attribute the round given the highest approximation ratio still accepted.
    pub fn verdict(&self, tolerance: f64) -> Verdict {
        match (self.generator, self.solver) {
            (GeneratorResult::Cancelled, _) | (_, Some(SolverResult::Cancelled)) => {
                Verdict::Cancelled
            }
            (GeneratorResult::Ok, Some(SolverResult::Ok)) => {
                if self.approximation_ratio.unwrap_or(1.0) <= tolerance {
                    Verdict::Solved
                } else {
                    Verdict::Failed
                }
            }
            (GeneratorResult::Ok, Some(_)) => Verdict::Failed,
            // a valid instance always gets a solver run, this only happens on hand-built records
            (GeneratorResult::Ok, None) => Verdict::Cancelled,
            _ => Verdict::GeneratorFault,
        }
    }

    /// True if the generator is to blame for this round.
    pub fn is_generator_fault(&self) -> bool {
        matches!(
            self.generator,
            GeneratorResult::Timeout | GeneratorResult::Crash | GeneratorResult::InvalidInstance
        )
    }
}

impl fmt::Display for GeneratorResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GeneratorResult::Ok => "ok",
            GeneratorResult::Timeout => "timeout",
            GeneratorResult::Crash => "crash",
            GeneratorResult::InvalidInstance => "invalid-instance",
            GeneratorResult::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl fmt::Display for SolverResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SolverResult::Ok => "ok",
            SolverResult::Timeout => "timeout",
            SolverResult::Crash => "crash",
            SolverResult::InvalidCertificate => "invalid-certificate",
            SolverResult::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl fmt::Display for RoundOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} n={} gen:{}", self.index, self.size, self.generator)?;
        if let Some(solver) = self.solver {
            write!(f, " sol:{solver}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod round_tests {
    use super::*;

    fn outcome(generator: GeneratorResult, solver: Option<SolverResult>) -> RoundOutcome {
        RoundOutcome {
            index: 0,
            size: 4,
            seed: 0,
            generator,
            generator_usage: Usage::default(),
            solver,
            solver_usage: solver.map(|_| Usage::default()),
            approximation_ratio: None,
            instance: None,
            certificate: None,
        }
    }

    #[test]
    fn verdicts() {
        use GeneratorResult as G;
        use SolverResult as S;
        assert_eq!(outcome(G::Ok, Some(S::Ok)).verdict(1.0), Verdict::Solved);
        assert_eq!(outcome(G::Ok, Some(S::Timeout)).verdict(1.0), Verdict::Failed);
        assert_eq!(outcome(G::Crash, None).verdict(1.0), Verdict::GeneratorFault);
        assert_eq!(outcome(G::InvalidInstance, None).verdict(1.0), Verdict::GeneratorFault);
        assert_eq!(outcome(G::Cancelled, None).verdict(1.0), Verdict::Cancelled);
        assert_eq!(outcome(G::Ok, Some(S::Cancelled)).verdict(1.0), Verdict::Cancelled);
    }

    #[test]
    fn tolerance_applies_to_valid_certificates() {
        let mut round = outcome(GeneratorResult::Ok, Some(SolverResult::Ok));
        round.approximation_ratio = Some(1.5);
        assert_eq!(round.verdict(1.0), Verdict::Failed);
        assert_eq!(round.verdict(2.0), Verdict::Solved);
    }

    #[test]
    fn display() {
        let round = outcome(GeneratorResult::Ok, Some(SolverResult::InvalidCertificate));
        assert_eq!(round.to_string(), "#0 n=4 gen:ok sol:invalid-certificate");
    }
}

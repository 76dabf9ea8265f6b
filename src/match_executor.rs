//! Runs a single round: the generator, then (on a valid instance) the solver.
//!
//! Every program failure is an expected outcome recorded in the returned [`RoundOutcome`].
//! Only a failure of the sandbox itself is returned as an error.

use std::collections::HashSet;

use tracing::{debug, instrument, warn};

use crate::{
    cancellation::Cancellation,
    constraints::MatchLimits,
    problem::Problem,
    round::{GeneratorResult, RoundOutcome, SolverResult, Usage},
    sandbox::{LimitKind, Sandbox, SandboxOutput, SandboxRequest},
    team::Program,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    Success,
    Timeout,
    Crash,
    Cancelled,
}

fn run_end(output: &SandboxOutput) -> RunEnd {
    if output.cancelled {
        return RunEnd::Cancelled;
    }
    match output.limit_hit {
        Some(LimitKind::WallTime | LimitKind::CpuTime) => RunEnd::Timeout,
        Some(LimitKind::Memory) => RunEnd::Crash,
        None if output.exit_status == Some(0) => RunEnd::Success,
        None => RunEnd::Crash,
    }
}

/// Stateless round runner. Cheap to share between threads; holds only read-only handles.
pub struct MatchExecutor<'a> {
    problem: &'a dyn Problem,
    sandbox: &'a dyn Sandbox,
    limits: MatchLimits,
    retain_payloads: bool,
}

impl<'a> MatchExecutor<'a> {
    /// Create an executor running programs through `sandbox` under `limits`.
    pub fn new(problem: &'a dyn Problem, sandbox: &'a dyn Sandbox, limits: MatchLimits) -> Self {
        Self {
            problem,
            sandbox,
            limits,
            retain_payloads: false,
        }
    }

    /// Keep instances and certificates in the produced outcomes.
    pub fn with_retain_payloads(mut self, value: bool) -> Self {
        self.retain_payloads = value;
        self
    }

    /// Run round `index` at `size` with `seed`.
    ///
    /// The generator receives `size` and `seed` as arguments; the solver receives `size` as
    /// argument and the instance on stdin.
    ///
    /// # Errors
    /// Only when the sandbox could not run a program at all.
    #[instrument(skip_all, fields(round = index, size))]
    pub fn run_round(
        &self,
        generator: &Program,
        solver: &Program,
        index: usize,
        size: u64,
        seed: u64,
        cancellation: &Cancellation,
    ) -> anyhow::Result<RoundOutcome> {
        let mut outcome = RoundOutcome {
            index,
            size,
            seed,
            generator: GeneratorResult::Ok,
            generator_usage: Usage::default(),
            solver: None,
            solver_usage: None,
            approximation_ratio: None,
            instance: None,
            certificate: None,
        };

        let generated = self.sandbox.run(
            SandboxRequest {
                program: generator,
                args: vec![size.to_string(), seed.to_string()],
                stdin: vec![],
                limits: self.limits.generator,
                cpus: HashSet::new(),
            },
            cancellation,
        )?;
        outcome.generator_usage = Usage::from(&generated);

        outcome.generator = match run_end(&generated) {
            RunEnd::Success => GeneratorResult::Ok,
            RunEnd::Timeout => GeneratorResult::Timeout,
            RunEnd::Crash => GeneratorResult::Crash,
            RunEnd::Cancelled => GeneratorResult::Cancelled,
        };
        if outcome.generator != GeneratorResult::Ok {
            debug!(result = %outcome.generator, "generator failed");
            return Ok(outcome);
        }

        let instance = generated.stdout;
        if !self.problem.validate_instance(&instance, size) {
            warn!("generator created a malformed instance");
            outcome.generator = GeneratorResult::InvalidInstance;
            if self.retain_payloads {
                outcome.instance = Some(instance);
            }
            return Ok(outcome);
        }

        let solved = self.sandbox.run(
            SandboxRequest {
                program: solver,
                args: vec![size.to_string()],
                stdin: instance.clone(),
                limits: self.limits.solver,
                cpus: HashSet::new(),
            },
            cancellation,
        )?;
        outcome.solver_usage = Some(Usage::from(&solved));

        let solver_result = match run_end(&solved) {
            RunEnd::Success => {
                let certificate = &solved.stdout;
                if self.problem.validate_certificate(&instance, certificate) {
                    outcome.approximation_ratio =
                        Some(self.problem.approximation_ratio(&instance, certificate));
                    SolverResult::Ok
                } else {
                    warn!("solver yields an incorrect solution");
                    SolverResult::InvalidCertificate
                }
            }
            RunEnd::Timeout => SolverResult::Timeout,
            RunEnd::Crash => SolverResult::Crash,
            RunEnd::Cancelled => SolverResult::Cancelled,
        };
        debug!(result = %solver_result, ratio = ?outcome.approximation_ratio, "solver done");
        outcome.solver = Some(solver_result);

        if self.retain_payloads {
            outcome.instance = Some(instance);
            outcome.certificate = Some(solved.stdout);
        }
        Ok(outcome)
    }
}

//! Scripted sandbox and toy problem shared by the integration tests.
#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::bail;
use battle_engine::{
    cancellation::Cancellation,
    constraints::{Constraints, ConstraintsBuilder},
    prelude::*,
    sandbox::{Sandbox, SandboxOutput, SandboxRequest},
};
use tracing::Level;

pub fn init_test_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_ansi(true)
        .with_thread_names(true)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

/// Instances are up to `size` whitespace separated numbers, certificates their sum.
pub struct Sum;

fn numbers(bytes: &[u8]) -> Option<Vec<u64>> {
    std::str::from_utf8(bytes)
        .ok()?
        .split_whitespace()
        .map(|n| n.parse().ok())
        .collect()
}

impl Problem for Sum {
    fn name(&self) -> &str {
        "sum"
    }

    fn validate_instance(&self, instance: &[u8], size: u64) -> bool {
        numbers(instance).is_some_and(|n| !n.is_empty() && n.len() as u64 <= size)
    }

    fn validate_certificate(&self, instance: &[u8], certificate: &[u8]) -> bool {
        match (numbers(instance), numbers(certificate)) {
            (Some(instance), Some(certificate)) => certificate == [instance.iter().sum::<u64>()],
            _ => false,
        }
    }
}

/// Interprets program paths as behaviours:
/// - `gen`: writes `size` ones
/// - `gen-crash`: exits with status 1
/// - `sol`: answers correctly
/// - `sol-upto-N`: answers correctly up to size `N`, then answers `0`
/// - `sol-broken`: the sandbox fails to run it
/// - `missing`: rejected by `check_program`
///
/// Every invocation lasts `delay` unless cancelled, and the number of simultaneous invocations
/// is tracked.
#[derive(Default)]
pub struct ScriptedSandbox {
    delay: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
    invocations: AtomicUsize,
}

impl ScriptedSandbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    fn answer(&self, request: &SandboxRequest<'_>) -> anyhow::Result<SandboxOutput> {
        let exited = |code: i32, stdout: String| SandboxOutput {
            exit_status: Some(code),
            stdout: stdout.into_bytes(),
            wall_time: self.delay,
            memory_peak: 1_000,
            ..Default::default()
        };
        let size: u64 = request.args[0].parse()?;
        let path = request.program.path.to_string_lossy().to_string();
        let output = match path.as_str() {
            "gen" => exited(0, vec!["1"; size as usize].join(" ")),
            "gen-crash" => exited(1, String::new()),
            "sol" => exited(0, sum(&request.stdin)),
            "sol-broken" => bail!("could not start '{path}'"),
            other => match other.strip_prefix("sol-upto-") {
                Some(limit) if size <= limit.parse()? => exited(0, sum(&request.stdin)),
                Some(_) => exited(0, "0".to_string()),
                None => bail!("unknown program '{path}'"),
            },
        };
        Ok(output)
    }
}

fn sum(stdin: &[u8]) -> String {
    numbers(stdin)
        .map(|n| n.iter().sum::<u64>().to_string())
        .unwrap_or_default()
}

impl Sandbox for ScriptedSandbox {
    fn run(
        &self,
        request: SandboxRequest<'_>,
        cancellation: &Cancellation,
    ) -> anyhow::Result<SandboxOutput> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let start = Instant::now();
        let mut cancelled = false;
        while start.elapsed() < self.delay {
            if cancellation.is_cancelled() {
                cancelled = true;
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        let output = if cancelled || cancellation.is_cancelled() {
            Ok(SandboxOutput {
                cancelled: true,
                wall_time: start.elapsed(),
                ..Default::default()
            })
        } else {
            self.answer(&request)
        };

        self.current.fetch_sub(1, Ordering::SeqCst);
        output
    }

    fn check_program(&self, program: &Program) -> anyhow::Result<()> {
        if program.path.to_str() == Some("missing") {
            bail!("artifact not found");
        }
        Ok(())
    }
}

pub fn team(name: &str, generator: &str, solver: &str) -> Arc<Team> {
    Team::new(name, Program::new(generator), Program::new(solver))
}

pub fn constraints(parallel: usize) -> ConstraintsBuilder {
    ConstraintsBuilder::new()
        .with_max_total_ram(1_000)
        .with_generator_ram(10)
        .with_solver_ram(10)
        .with_total_cpu_count(8)
        .with_max_parallel_runs(parallel)
}

pub fn build(builder: ConstraintsBuilder) -> Constraints {
    builder.build().expect("valid constraints")
}

pub fn quiet() -> Configuration {
    Configuration::new().with_verbose(false)
}

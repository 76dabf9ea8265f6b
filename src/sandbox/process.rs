use std::{
    collections::HashSet,
    io::{ErrorKind, Read, Write},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, instrument, trace, warn};

use super::{LimitKind, Sandbox, SandboxOutput, SandboxRequest};
use crate::{
    cancellation::Cancellation, cgroup_manager::LimitedProcess, configuration::Configuration,
    team::Program,
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const KILL_TIMEOUT: Duration = Duration::from_secs(1);
/// Per stream. Anything beyond is read and discarded so the program never blocks on a full pipe.
const MAX_CAPTURED_OUTPUT: usize = 64 * 1024 * 1024;

/// Runs team programs as local processes.
///
/// Each run gets its own cgroup (memory hard limit, pid limit, cpuset). When cgroups v2 is not
/// usable and [`Configuration::with_allow_uncontained`] is set, the program runs as a plain
/// child process instead. In both cases wall time, CPU time and memory are sampled while the
/// program runs and the program is killed as soon as one of its limits is exceeded or its
/// cancellation signal fires.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    config: Configuration,
}

impl ProcessSandbox {
    /// Create a sandbox following `config` (containment fallback and stderr forwarding).
    pub fn new(config: Configuration) -> Self {
        Self { config }
    }

    fn launch(
        &self,
        args: &[String],
        request: &SandboxRequest<'_>,
    ) -> anyhow::Result<LimitedProcess> {
        let program = request.program;
        let memory = i64::try_from(request.limits.memory).unwrap_or(i64::MAX);
        let cpus = cpus_to_string(&request.cpus);
        match LimitedProcess::launch(&program.path, args, memory, &cpus) {
            Ok(process) => Ok(process),
            Err(e) if self.config.allow_uncontained => {
                warn!("running '{}' uncontained: {e:#}", program.path.display());
                LimitedProcess::launch_without_container(&program.path, args)
            }
            Err(e) => Err(e.context("child + cgroup creation failed")),
        }
    }
}

fn cpus_to_string(cpus: &HashSet<u8>) -> String {
    let mut cpus = cpus.iter().copied().collect::<Vec<_>>();
    cpus.sort_unstable();
    cpus.iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// One output stream of a program, drained on a helper thread.
struct OutputReader {
    captured: Arc<Mutex<Vec<u8>>>,
    done: Receiver<()>,
}

impl OutputReader {
    fn spawn<R: Read + Send + 'static>(source: Option<R>) -> Option<OutputReader> {
        let mut source = source?;
        let captured = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done) = mpsc::channel();
        let sink = Arc::clone(&captured);
        thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match source.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        let mut buf = sink.lock().unwrap_or_else(PoisonError::into_inner);
                        let room = MAX_CAPTURED_OUTPUT.saturating_sub(buf.len());
                        buf.extend_from_slice(&chunk[..n.min(room)]);
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            drop(done_tx);
        });
        Some(OutputReader { captured, done })
    }

    /// Whatever was read once the stream closes, or at `deadline` if something outside the
    /// program's reach still holds it open.
    fn collect(self, deadline: Instant) -> Vec<u8> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        if let Err(RecvTimeoutError::Timeout) = self.done.recv_timeout(timeout) {
            warn!("output stream still open after the program ended, abandoning it");
        }
        let mut captured = self.captured.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *captured)
    }
}

fn collect_output(reader: Option<OutputReader>, deadline: Instant) -> Vec<u8> {
    reader
        .map(|reader| reader.collect(deadline))
        .unwrap_or_default()
}

impl Sandbox for ProcessSandbox {
    #[instrument(skip_all, fields(program = %request.program.path.display()))]
    fn run(
        &self,
        request: SandboxRequest<'_>,
        cancellation: &Cancellation,
    ) -> anyhow::Result<SandboxOutput> {
        if cancellation.is_cancelled() {
            return Ok(SandboxOutput {
                cancelled: true,
                ..Default::default()
            });
        }

        let program = request.program;
        let mut args = program.args.clone();
        args.extend(request.args.iter().cloned());
        let limits = request.limits;

        let mut process = self.launch(&args, &request)?;
        let start = Instant::now();
        trace!(
            pid = process.child.id(),
            contained = process.is_contained(),
            "program launched"
        );

        // a program that never reads its stdin must not block us, hence the detached thread
        if let Some(mut stdin) = process.child.stdin.take() {
            let payload = request.stdin;
            thread::spawn(move || {
                let _ = stdin.write_all(&payload);
            });
        }
        let stdout = OutputReader::spawn(process.child.stdout.take());
        let stderr = OutputReader::spawn(process.child.stderr.take());

        let pid = Pid::from_u32(process.child.id());
        let refresh = ProcessRefreshKind::nothing().with_memory().with_cpu();
        let mut sys = System::new();
        let mut memory_peak = 0u64;
        let mut cpu_time = Duration::ZERO;
        let mut last_sample = start;
        let mut limit_hit = None;
        let mut cancelled = false;

        let status = loop {
            if let Some(status) = process.child.try_wait().context("could not poll program")? {
                break Some(status);
            }

            let now = Instant::now();
            sys.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, refresh);
            if let Some(proc_info) = sys.process(pid) {
                memory_peak = memory_peak.max(proc_info.memory());
                let share = f64::from(proc_info.cpu_usage()).max(0.0) / 100.0;
                cpu_time += now.duration_since(last_sample).mul_f64(share);
            }
            last_sample = now;

            if now.duration_since(start) >= limits.wall_time {
                limit_hit = Some(LimitKind::WallTime);
            } else if cpu_time >= limits.cpu_time {
                limit_hit = Some(LimitKind::CpuTime);
            } else if memory_peak > limits.memory as u64 {
                limit_hit = Some(LimitKind::Memory);
            } else if cancellation.is_cancelled() {
                cancelled = true;
            }

            if limit_hit.is_some() || cancelled {
                debug!(?limit_hit, cancelled, "killing program");
                process
                    .try_kill(KILL_TIMEOUT)
                    .context("could not kill program")?;
                break None;
            }
            thread::sleep(POLL_INTERVAL);
        };
        let wall_time = start.elapsed();

        if status.is_some() {
            // leftovers spawned by the program, inside its cgroup or its process group
            if let Err(e) = process.try_kill(KILL_TIMEOUT) {
                warn!("cleanup after exit failed: {e:#}");
            }
        }

        let drain_deadline = Instant::now() + KILL_TIMEOUT;
        let stdout = collect_output(stdout, drain_deadline);
        let stderr = collect_output(stderr, drain_deadline);
        if self.config.debug_stderr() && !stderr.is_empty() {
            debug!(stderr = %String::from_utf8_lossy(&stderr), "program stderr");
        }

        Ok(SandboxOutput {
            exit_status: status.and_then(|s| s.code()),
            stdout,
            stderr,
            wall_time,
            cpu_time,
            memory_peak,
            limit_hit,
            cancelled,
        })
    }

    fn check_program(&self, program: &Program) -> anyhow::Result<()> {
        let path = &program.path;
        // bare names are resolved through PATH at spawn time
        if path.components().count() > 1 && !path.is_file() {
            bail!("artifact '{}' not found", path.display());
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod process_sandbox_tests {
    use super::*;
    use crate::constraints::RunLimits;

    fn sandbox() -> ProcessSandbox {
        ProcessSandbox::new(Configuration::new().with_allow_uncontained(true))
    }

    fn sh(script: &str) -> Program {
        Program::new("sh").with_args(["-c", script])
    }

    fn request<'a>(program: &'a Program, stdin: &[u8], limits: RunLimits) -> SandboxRequest<'a> {
        SandboxRequest {
            program,
            args: vec!["7".to_string()],
            stdin: stdin.to_vec(),
            limits,
            cpus: HashSet::new(),
        }
    }

    #[test]
    fn captures_output_and_arguments() {
        let program = sh("echo \"size $0\"; cat");
        let output = sandbox()
            .run(request(&program, b"payload", RunLimits::unlimited()), &Cancellation::new())
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, b"size 7\npayload");
    }

    #[test]
    fn reports_nonzero_exit() {
        let program = sh("echo oops >&2; exit 3");
        let output = sandbox()
            .run(request(&program, b"", RunLimits::unlimited()), &Cancellation::new())
            .unwrap();
        assert_eq!(output.exit_status, Some(3));
        assert!(!output.success());
        assert!(!output.killed_by_limit());
        assert_eq!(output.stderr, b"oops\n");
    }

    #[test]
    fn kills_on_wall_time() {
        let program = sh("exec sleep 5");
        let limits = RunLimits {
            wall_time: Duration::from_millis(100),
            ..RunLimits::unlimited()
        };
        let output = sandbox()
            .run(request(&program, b"", limits), &Cancellation::new())
            .unwrap();
        assert_eq!(output.limit_hit, Some(LimitKind::WallTime));
        assert!(output.wall_time < Duration::from_secs(5));
    }

    #[test]
    fn kills_the_shell_and_its_children_on_wall_time() {
        let program = sh("sleep 5; true");
        let limits = RunLimits {
            wall_time: Duration::from_millis(100),
            ..RunLimits::unlimited()
        };
        let output = sandbox()
            .run(request(&program, b"", limits), &Cancellation::new())
            .unwrap();
        assert_eq!(output.limit_hit, Some(LimitKind::WallTime));
        assert!(output.wall_time < Duration::from_secs(2));
    }

    #[test]
    fn background_children_do_not_outlive_the_run() {
        let program = sh("sleep 5 & echo 1");
        let limits = RunLimits {
            wall_time: Duration::from_millis(500),
            ..RunLimits::unlimited()
        };
        let start = Instant::now();
        let output = sandbox()
            .run(request(&program, b"", limits), &Cancellation::new())
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(3), "took {:?}", start.elapsed());
        assert_eq!(output.exit_status, Some(0));
        assert_eq!(output.stdout, b"1\n");
    }

    #[test]
    fn stops_on_cancellation() {
        let program = sh("exec sleep 5");
        let cancellation = Cancellation::with_timeout(Duration::from_millis(100));
        let output = sandbox()
            .run(request(&program, b"", RunLimits::unlimited()), &cancellation)
            .unwrap();
        assert!(output.cancelled);
        assert!(!output.killed_by_limit());
    }

    #[test]
    fn missing_artifact_is_detected() {
        let program = Program::new("/definitely/not/here/generator");
        assert!(sandbox().check_program(&program).is_err());
        assert!(sandbox().check_program(&sh("true")).is_ok());
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let program = Program::new("/definitely/not/here/solver");
        let result = sandbox().run(
            request(&program, b"", RunLimits::unlimited()),
            &Cancellation::new(),
        );
        assert!(result.is_err());
    }
}

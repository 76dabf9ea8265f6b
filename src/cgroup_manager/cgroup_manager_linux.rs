use std::{
    path::Path,
    process::Child,
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use anyhow::{self, bail, Context};
use cgroups_rs::Cgroup;
use nix::sys::signal::{kill, Signal};
use tracing::{error, warn};

use super::{create_process, kill_process_group};

const MAX_PIDS: i64 = 100;

pub fn get_current_user_id() -> anyhow::Result<String> {
    let output = std::process::Command::new("id")
        .arg("-u")
        .output()
        .context("Could not launch 'id -u'")?;
    let stdout = output.stdout;
    let untrimed_id = std::str::from_utf8(&stdout).context("id is not a valid string")?;
    Ok(untrimed_id.trim().to_string())
}

pub fn get_cgroup_path(user_id: &str, group_name: &str) -> String {
    format!("user.slice/user-{user_id}.slice/user@{user_id}.service/{group_name}")
}

/// Create a cgroup at `path`.
///
/// * `max_memory` - Maximum available memory in Bytes. Non-positive means no restriction.
/// * `max_pids` - Maximum number of PIDS inside the cgroup at any time. Non-positive means no restriction.
/// * `cpus` - which cpus the members can run one. Uses comma separated cpu ranges ("1-5,7", "1,3,4", ...). Empty string means no restriction.
///
/// # Errors
///
/// This function will return an error if the cgroup could not be created. This can happen if the parameters are incorrect or if cgroup is not available.
pub fn create_cgroup(
    path: &str,
    max_memory: i64,
    max_pids: i64,
    cpus: &str,
) -> anyhow::Result<Cgroup> {
    let mut builder = cgroups_rs::cgroup_builder::CgroupBuilder::new(path);
    if max_memory > 0 {
        builder = builder.memory().memory_hard_limit(max_memory).done();
    }
    if max_pids > 0 {
        builder = builder
            .pid()
            .maximum_number_of_processes(cgroups_rs::MaxValue::Value(max_pids))
            .done();
    }
    if !cpus.is_empty() {
        builder = builder.cpu().cpus(cpus.to_string()).done();
    }
    let hierarchy = cgroups_rs::hierarchies::auto();
    // the kill and cleanup paths below rely on v2 semantics
    if !hierarchy.v2() {
        bail!("cgroup v2 hierarchy not available");
    }
    builder.build(hierarchy).context("could not create cgroup")
}

/// SIGKILL every process still listed in `cgroup`, for hierarchies where `cgroup.kill` is
/// missing.
fn kill_tasks(cgroup: &Cgroup) {
    for task in cgroup.tasks() {
        let pid = nix::unistd::Pid::from_raw(task.pid as i32);
        if let Err(e) = kill(pid, Signal::SIGKILL) {
            warn!("could not kill task {pid} of cgroup: {e}");
        }
    }
}

fn wait_for_process_cleanup(cgroup: &Cgroup, max_duration: Duration) -> anyhow::Result<()> {
    let deadline = Instant::now() + max_duration;
    while !cgroup.tasks().is_empty() {
        if Instant::now() > deadline {
            anyhow::bail!("processes still alive in cgroup after {max_duration:?}");
        }
        std::thread::sleep(std::cmp::min(Duration::from_millis(10), max_duration / 10));
    }
    Ok(())
}

fn create_process_in_cgroup(
    command: &Path,
    args: &[String],
    group: &Cgroup,
) -> anyhow::Result<Child> {
    let mut child = create_process(command, args)?;

    let pid = child.id() as u64;
    let addition = group.add_task_by_tgid(cgroups_rs::CgroupPid { pid });
    if addition.is_err() {
        let kill = child.kill();
        // reap it, the error below is what matters
        let _ = child.wait();

        addition.with_context(|| {
            if let Err(err) = kill {
                format!(
                    "could not add process to cgroup, and process could not be killed either ({err})"
                )
            } else {
                "could not add process to cgroup".to_string()
            }
        })?;
    }
    Ok(child)
}

/// A child process, optionally confined in its own cgroup.
///
/// The process (and every process it spawned inside the cgroup) is killed on drop, and the
/// cgroup removed.
#[derive(Debug)]
pub struct LimitedProcess {
    pub child: Child,
    cgroup: Option<Cgroup>,
    cleaned_up: bool,
}

impl LimitedProcess {
    /// Launch `command` inside a fresh cgroup limited to `max_memory` bytes and `cpus`.
    pub fn launch(
        command: &Path,
        args: &[String],
        max_memory: i64,
        cpus: &str,
    ) -> anyhow::Result<LimitedProcess> {
        static COUNTER: AtomicU32 = AtomicU32::new(1);
        let user_id = get_current_user_id().context("could not get user id")?;
        // a new cgroup per process, unique inside this host process
        let group_name = format!(
            "BATTLE_ENGINE_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let path = get_cgroup_path(&user_id, &group_name);
        let group = create_cgroup(&path, max_memory, MAX_PIDS, cpus)
            .context("could not create cgroup")?;
        let child = match create_process_in_cgroup(command, args, &group) {
            Ok(child) => child,
            Err(e) => {
                let _ = group.delete();
                return Err(e.context("could not create process in cgroup"));
            }
        };

        Ok(LimitedProcess {
            child,
            cgroup: Some(group),
            cleaned_up: false,
        })
    }

    /// Launch `command` as a plain child process, without any containment.
    pub fn launch_without_container(
        command: &Path,
        args: &[String],
    ) -> anyhow::Result<LimitedProcess> {
        let child = create_process(command, args).context("could not create process")?;

        Ok(LimitedProcess {
            child,
            cgroup: None,
            cleaned_up: false,
        })
    }

    pub fn is_contained(&self) -> bool {
        self.cgroup.is_some()
    }

    /// Kill the process and everything left in its cgroup (or its process group when
    /// uncontained), then remove the cgroup.
    pub fn try_kill(&mut self, max_duration: Duration) -> anyhow::Result<()> {
        match &mut self.cgroup {
            Some(cgroup) => {
                if let Err(e) = cgroup.kill() {
                    warn!("cgroup kill failed, falling back to signals: {e}");
                    kill_process_group(&self.child)?;
                    let _ = self.child.kill();
                    kill_tasks(cgroup);
                }
                let _ = self.child.wait();
                wait_for_process_cleanup(cgroup, max_duration)
                    .context("process cleanup timed out")?;
                // at this point the processes are gone, a leftover cgroup is only clutter
                self.cleaned_up = true;
                if let Err(e) = cgroup.delete() {
                    warn!("Failed to remove cgroup. If this happens a lot, it may slow down the computer. {e}");
                }
                Ok(())
            }
            None => {
                // also reaches whatever the program left behind after exiting
                kill_process_group(&self.child)?;
                if self.child.try_wait().context("could not poll process")?.is_none() {
                    self.child.kill().context("could not kill process")?;
                }
                let _ = self.child.wait();
                self.cleaned_up = true;
                Ok(())
            }
        }
    }
}

impl Drop for LimitedProcess {
    fn drop(&mut self) {
        static CLEANUP_DURATION: Duration = Duration::from_secs(1);
        if !self.cleaned_up {
            if let Err(e) = self.try_kill(CLEANUP_DURATION) {
                error!("could not kill process/cgroup on LimitedProcess::drop: {e:#}");
            }
        }
    }
}

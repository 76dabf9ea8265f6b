#[cfg(target_os = "linux")]
mod cgroup_manager_linux;

#[cfg(target_os = "linux")]
pub use cgroup_manager_linux::*;

#[cfg(not(target_os = "linux"))]
mod cgroup_manager_stub;

use std::{
    path::Path,
    process::{Child, Stdio},
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
pub use cgroup_manager_stub::*;

/// Spawns `command` with every standard stream piped back to the sandbox.
///
/// On unix the child leads its own process group, so that everything it forks can be killed
/// with it, even once the child itself is gone.
fn create_process(command: &Path, args: &[String]) -> anyhow::Result<Child> {
    let mut cmd = std::process::Command::new(command);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd.spawn()
        .with_context(|| format!("could not spawn '{}'", command.display()))
}

/// Sends SIGKILL to the process group led by `child`. A group with no member left is not an
/// error.
#[cfg(unix)]
fn kill_process_group(child: &Child) -> anyhow::Result<()> {
    use nix::{
        errno::Errno,
        sys::signal::{killpg, Signal},
        unistd::Pid,
    };

    let group = Pid::from_raw(child.id() as i32);
    match killpg(group, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("could not kill process group {group}")),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) -> anyhow::Result<()> {
    Ok(())
}

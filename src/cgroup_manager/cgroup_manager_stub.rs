use std::{path::Path, process::Child, time::Duration};

use anyhow::{self, bail, Context};
use tracing::error;

use super::{create_process, kill_process_group};

#[derive(Debug)]
pub struct LimitedProcess {
    pub child: Child,
    cleaned_up: bool,
}

impl LimitedProcess {
    pub fn launch(
        _command: &Path,
        _args: &[String],
        _max_memory: i64,
        _cpus: &str,
    ) -> anyhow::Result<LimitedProcess> {
        bail!("cgroups only available on linux")
    }

    pub fn launch_without_container(
        command: &Path,
        args: &[String],
    ) -> anyhow::Result<LimitedProcess> {
        let child = create_process(command, args).context("could not create process")?;

        Ok(LimitedProcess {
            child,
            cleaned_up: false,
        })
    }

    pub fn is_contained(&self) -> bool {
        false
    }

    pub fn try_kill(&mut self, _max_duration: Duration) -> anyhow::Result<()> {
        kill_process_group(&self.child)?;
        if self.child.try_wait().context("could not poll process")?.is_none() {
            self.child.kill().context("could not kill process")?;
        }
        let _ = self.child.wait();
        self.cleaned_up = true;
        Ok(())
    }
}

impl Drop for LimitedProcess {
    fn drop(&mut self) {
        static CLEANUP_DURATION: Duration = Duration::from_secs(1);
        if !self.cleaned_up {
            if let Err(e) = self.try_kill(CLEANUP_DURATION) {
                error!("could not kill process on LimitedProcess::drop: {e:#}");
            }
        }
    }
}

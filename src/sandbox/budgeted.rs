use std::sync::Arc;

use tracing::trace;

use super::{Sandbox, SandboxOutput, SandboxRequest};
use crate::{cancellation::Cancellation, resource_pool::ResourcePool, team::Program};

/// Holds a resource slot around every invocation of the wrapped sandbox.
///
/// The pinned CPUs of the request are replaced by the ones of the acquired slot.
pub(crate) struct BudgetedSandbox<S> {
    inner: S,
    pool: Arc<ResourcePool>,
}

impl<S: Sandbox> BudgetedSandbox<S> {
    pub(crate) fn new(inner: S, pool: Arc<ResourcePool>) -> Self {
        Self { inner, pool }
    }
}

impl<S: Sandbox> Sandbox for BudgetedSandbox<S> {
    fn run(
        &self,
        mut request: SandboxRequest<'_>,
        cancellation: &Cancellation,
    ) -> anyhow::Result<SandboxOutput> {
        let Some(slot) = self.pool.acquire(request.limits.memory, cancellation)? else {
            trace!("cancelled while waiting for a slot");
            return Ok(SandboxOutput {
                cancelled: true,
                ..Default::default()
            });
        };
        request.cpus = slot.cpus();
        let output = self.inner.run(request, cancellation);
        drop(slot);
        output
    }

    fn check_program(&self, program: &Program) -> anyhow::Result<()> {
        self.inner.check_program(program)
    }
}

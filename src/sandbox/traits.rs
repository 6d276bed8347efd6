/*!
 * Sandbox Traits
 * The capability contract every backend implements
 */

use super::context::ExecContext;
use super::types::{BackendKind, CommandOptions, ExecutionResult, InstanceState, ProbeStatus};
use crate::core::errors::{SandboxError, SandboxResult};
use async_trait::async_trait;

/// One configured isolation boundary
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Backend implementing this instance
    fn kind(&self) -> BackendKind;

    /// Current lifecycle state
    fn state(&self) -> InstanceState;

    /// Execute a whitespace-split command line
    ///
    /// An empty command is rejected with `ConfigInvalid` before anything is spawned.
    async fn run(&self, ctx: &ExecContext, cmd: &str) -> SandboxResult<ExecutionResult> {
        let options = CommandOptions::from_command_line(cmd)?;
        self.run_with_options(ctx, options).await
    }

    /// Execute with per-call binds, environment, directory and stdin
    async fn run_with_options(
        &self,
        ctx: &ExecContext,
        options: CommandOptions,
    ) -> SandboxResult<ExecutionResult>;

    /// Stage `source` as a script and execute it
    async fn run_source(&self, ctx: &ExecContext, source: &str) -> SandboxResult<ExecutionResult>;

    /// Alias of `run_source`
    async fn run_script(&self, ctx: &ExecContext, source: &str) -> SandboxResult<ExecutionResult> {
        self.run_source(ctx, source).await
    }

    async fn start(&self) -> SandboxResult<()> {
        ensure_not_cleared(self.kind(), self.state())
    }

    async fn wait(&self) -> SandboxResult<()> {
        ensure_not_cleared(self.kind(), self.state())
    }

    async fn stop(&self) -> SandboxResult<()> {
        ensure_not_cleared(self.kind(), self.state())
    }

    /// Release every resource; idempotent
    async fn clear(&self) -> SandboxResult<()>;
}

/// Host-side capability checks for one backend
#[async_trait]
pub trait CapabilityProbe: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// The backend's tool is reachable
    async fn is_installed(&self) -> ProbeStatus;

    /// The tool is usable right now (daemon up, feature on)
    async fn is_enabled(&self) -> ProbeStatus;

    /// Turn the feature on where the platform allows it
    async fn activate(&self) -> SandboxResult<bool> {
        Err(SandboxError::NotToggleable(self.kind().to_string()))
    }

    /// Turn the feature off where the platform allows it
    async fn deactivate(&self) -> SandboxResult<bool> {
        Err(SandboxError::NotToggleable(self.kind().to_string()))
    }

    /// Installed and enabled, or the first failing check's error
    async fn ensure_available(&self) -> SandboxResult<()> {
        self.is_installed().await.into_result()?;
        self.is_enabled().await.into_result()
    }
}

fn ensure_not_cleared(kind: BackendKind, state: InstanceState) -> SandboxResult<()> {
    if state == InstanceState::Cleared {
        return Err(SandboxError::Cleared(kind.to_string()));
    }
    Ok(())
}

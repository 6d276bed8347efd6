/*!
 * Unsupported Backend
 * Placeholder instance for a backend the running platform cannot provide
 */

use crate::core::errors::{SandboxError, SandboxResult};
use crate::sandbox::context::ExecContext;
use crate::sandbox::traits::Sandbox;
use crate::sandbox::types::{BackendKind, CommandOptions, ExecutionResult, InstanceState};
use async_trait::async_trait;

/// Every operation fails with `NotImplemented`; `clear` succeeds
#[derive(Debug, Clone, Copy)]
pub struct Unsupported {
    kind: BackendKind,
}

impl Unsupported {
    pub fn new(kind: BackendKind) -> Self {
        Self { kind }
    }

    fn error(&self) -> SandboxError {
        SandboxError::NotImplemented(format!(
            "{} is not supported on {}",
            self.kind,
            std::env::consts::OS
        ))
    }
}

#[async_trait]
impl Sandbox for Unsupported {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn state(&self) -> InstanceState {
        InstanceState::Probed
    }

    async fn run(&self, _ctx: &ExecContext, _cmd: &str) -> SandboxResult<ExecutionResult> {
        Err(self.error())
    }

    async fn run_with_options(
        &self,
        _ctx: &ExecContext,
        _options: CommandOptions,
    ) -> SandboxResult<ExecutionResult> {
        Err(self.error())
    }

    async fn run_source(&self, _ctx: &ExecContext, _source: &str) -> SandboxResult<ExecutionResult> {
        Err(self.error())
    }

    async fn start(&self) -> SandboxResult<()> {
        Err(self.error())
    }

    async fn wait(&self) -> SandboxResult<()> {
        Err(self.error())
    }

    async fn stop(&self) -> SandboxResult<()> {
        Err(self.error())
    }

    async fn clear(&self) -> SandboxResult<()> {
        Ok(())
    }
}

/*!
 * Sandbox Factory
 * Builds a boxed backend instance from a tagged configuration
 */

use super::backends::{
    BubblewrapConfig, DarwinSeatbelt, DockerConfig, DockerContainer, LinuxBubblewrap,
    LinuxSystemdRun, SeatbeltConfig, SystemdRunConfig, Unsupported, WindowsSandbox,
    WindowsSandboxConfig,
};
use super::context::ExecContext;
use super::traits::Sandbox;
use super::types::BackendKind;
use crate::core::errors::{SandboxError, SandboxResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// Configuration of any backend, tagged by `"backend"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BackendConfig {
    Seatbelt(SeatbeltConfig),
    SystemdRun(SystemdRunConfig),
    Bubblewrap(BubblewrapConfig),
    WindowsSandbox(WindowsSandboxConfig),
    Docker(DockerConfig),
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::Seatbelt(_) => BackendKind::Seatbelt,
            BackendConfig::SystemdRun(_) => BackendKind::SystemdRun,
            BackendConfig::Bubblewrap(_) => BackendKind::Bubblewrap,
            BackendConfig::WindowsSandbox(_) => BackendKind::WindowsSandbox,
            BackendConfig::Docker(_) => BackendKind::Docker,
        }
    }

    /// Fill in the instance temp dir parent when the configuration leaves it unset
    pub fn with_default_temp_dir(mut self, dir: Option<PathBuf>) -> Self {
        let slot = match &mut self {
            BackendConfig::Seatbelt(c) => &mut c.temp_dir,
            BackendConfig::SystemdRun(c) => &mut c.temp_dir,
            BackendConfig::Bubblewrap(c) => &mut c.temp_dir,
            BackendConfig::WindowsSandbox(c) => &mut c.temp_dir,
            BackendConfig::Docker(c) => &mut c.temp_dir,
        };
        if slot.is_none() {
            *slot = dir;
        }
        self
    }
}

/// Probe, compile and construct the configured backend
///
/// A backend the running OS cannot provide fails with `NotImplemented`.
pub async fn create(ctx: &ExecContext, config: BackendConfig) -> SandboxResult<Box<dyn Sandbox>> {
    let kind = config.kind();
    if !kind.supported_here() {
        return Err(SandboxError::NotImplemented(format!(
            "{} is not supported on {}",
            kind,
            std::env::consts::OS
        )));
    }

    let construct = async move {
        let sandbox: Box<dyn Sandbox> = match config {
            BackendConfig::Seatbelt(c) => Box::new(DarwinSeatbelt::new(c).await?),
            BackendConfig::SystemdRun(c) => Box::new(LinuxSystemdRun::new(c).await?),
            BackendConfig::Bubblewrap(c) => Box::new(LinuxBubblewrap::new(c).await?),
            BackendConfig::WindowsSandbox(c) => Box::new(WindowsSandbox::new(c).await?),
            BackendConfig::Docker(c) => Box::new(DockerContainer::new(c).await?),
        };
        Ok::<_, SandboxError>(sandbox)
    };

    let sandbox = ctx
        .run_until_done(construct)
        .await
        .map_err(|interrupt| interrupt.into_error(&format!("creating {} sandbox", kind)))??;
    info!(backend = kind.as_str(), "sandbox created");
    Ok(sandbox)
}

/// Like `create`, but an unsupported platform yields an `Unsupported` instance
pub async fn create_or_unsupported(
    ctx: &ExecContext,
    config: BackendConfig,
) -> SandboxResult<Box<dyn Sandbox>> {
    let kind = config.kind();
    if !kind.supported_here() {
        return Ok(Box::new(Unsupported::new(kind)));
    }
    create(ctx, config).await
}

/*!
 * Capability Probe
 * PATH lookup and the probe registry
 */

use super::backends::{BubblewrapProbe, DockerProbe, SeatbeltProbe, SystemdRunProbe, WindowsSandboxProbe};
use super::context::ExecContext;
use super::exec::{execute, ProcessSpec};
use super::traits::CapabilityProbe;
use super::types::{BackendKind, ExecutionResult, ProbeStatus};
use crate::core::errors::{SandboxError, SandboxResult};
use crate::core::limits::PROBE_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::PathBuf;
use tracing::debug;

/// Locate `name` on `PATH`
///
/// `PATHEXT` is honored on Windows; on Unix only executable files match.
pub fn lookup_executable(name: &str) -> SandboxResult<PathBuf> {
    which::which(name).map_err(|e| not_installed(name, e))
}

/// Locate `name` in an explicit search path
pub fn lookup_in(name: &str, search_path: impl AsRef<OsStr>) -> SandboxResult<PathBuf> {
    let cwd = std::env::current_dir().map_err(|e| SandboxError::NotInstalled(e.to_string()))?;
    which::which_in(name, Some(search_path), cwd).map_err(|e| not_installed(name, e))
}

fn not_installed(name: &str, err: which::Error) -> SandboxError {
    SandboxError::NotInstalled(format!("{} not found on PATH: {}", name, err))
}

/// Run a short probe subprocess under `PROBE_TIMEOUT`
pub async fn run_probe_command(program: &str, args: &[&str]) -> SandboxResult<ExecutionResult> {
    let spec = ProcessSpec::new(program).with_args(args.iter().copied());
    let result = execute(&spec, &ExecContext::with_timeout(PROBE_TIMEOUT)).await?;
    debug!(
        command = %result.command,
        exit_code = ?result.exit_code,
        "probe command finished"
    );
    Ok(result)
}

/// Probe succeeds only on a zero exit; other exits become `NotEnabled`
pub async fn require_probe_success(
    program: &str,
    args: &[&str],
    what: &str,
) -> SandboxResult<ExecutionResult> {
    let result = run_probe_command(program, args).await?;
    if result.success() {
        Ok(result)
    } else {
        Err(SandboxError::NotEnabled(format!(
            "{}: {} ({})",
            what,
            result.command,
            result.stderr_lossy().trim()
        )))
    }
}

/// Boxed probe for `kind`
pub fn probe_for(kind: BackendKind) -> Box<dyn CapabilityProbe> {
    match kind {
        BackendKind::Seatbelt => Box::new(SeatbeltProbe),
        BackendKind::SystemdRun => Box::new(SystemdRunProbe),
        BackendKind::Bubblewrap => Box::new(BubblewrapProbe),
        BackendKind::WindowsSandbox => Box::new(WindowsSandboxProbe),
        BackendKind::Docker => Box::new(DockerProbe),
    }
}

/// One backend's probe outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub kind: BackendKind,
    pub supported: bool,
    pub installed: ProbeStatus,
    pub enabled: ProbeStatus,
}

/// Probe every backend; unsupported platforms are reported without spawning
pub async fn probe_all() -> Vec<ProbeReport> {
    let mut reports = Vec::with_capacity(BackendKind::ALL.len());
    for kind in BackendKind::ALL {
        let supported = kind.supported_here();
        let (installed, enabled) = if supported {
            let probe = probe_for(kind);
            let installed = probe.is_installed().await;
            let enabled = if installed.available {
                probe.is_enabled().await
            } else {
                ProbeStatus::unavailable(SandboxError::NotEnabled(format!("{} not installed", kind)))
            };
            (installed, enabled)
        } else {
            let unsupported = SandboxError::NotImplemented(format!(
                "{} is not available on {}",
                kind,
                std::env::consts::OS
            ));
            (
                ProbeStatus::unavailable(unsupported.clone()),
                ProbeStatus::unavailable(unsupported),
            )
        };
        reports.push(ProbeReport {
            kind,
            supported,
            installed,
            enabled,
        });
    }
    reports
}

/*!
 * Sandbox Backends
 * One module per isolation technology
 */

mod bubblewrap;
mod docker;
mod seatbelt;
mod systemd;
mod unsupported;
mod windows;

pub use bubblewrap::{compile_bwrap_args, BubblewrapConfig, BubblewrapProbe, LinuxBubblewrap, Symlink};
pub use docker::{
    compile_container, parse_cpu_limit, parse_memory_limit, DockerConfig, DockerContainer,
    DockerProbe,
};
pub use seatbelt::{
    compile_profile, Action, DarwinSeatbelt, Scope, SeatbeltArg, SeatbeltConfig, SeatbeltProbe,
    SeatbeltRule,
};
pub use systemd::{
    compile_properties, Filter, LinuxSystemdRun, PolicyArg, PropertyRule, SystemdRunConfig,
    SystemdRunProbe,
};
pub use unsupported::Unsupported;
pub use windows::{
    compile_descriptor, host_addresses, MappedFolder, Toggle, WindowsSandbox,
    WindowsSandboxConfig, WindowsSandboxProbe,
};

use super::context::ExecContext;
use super::exec::{execute, ProcessSpec};
use super::types::{BackendKind, BindMount, CommandOptions, ExecutionResult};
use crate::core::errors::SandboxResult;
use crate::core::limits::{SCRIPT_FILE_NAME, SOURCE_MOUNT_POINT};
use std::path::Path;
use crate::monitoring::RunSpan;
use tracing::Instrument;

/// Execute a compiled launcher under a run span
pub(crate) async fn run_traced(
    kind: BackendKind,
    operation: &'static str,
    spec: &ProcessSpec,
    ctx: &ExecContext,
) -> SandboxResult<ExecutionResult> {
    let run = RunSpan::new(kind.as_str(), operation);
    let outcome = execute(spec, ctx).instrument(run.span()).await;
    record_outcome(&run, &outcome);
    outcome
}

pub(crate) fn record_outcome(run: &RunSpan, outcome: &SandboxResult<ExecutionResult>) {
    match outcome {
        Ok(result) => run.record_exit(result.exit_code),
        Err(e) => run.record_error(e),
    }
}

/// `<interpreter> /src/script.sh` with the staging directory bound at `/src`
pub(crate) fn staged_script_options(
    staged_dir: &Path,
    interpreter: &str,
    read_only: bool,
) -> CommandOptions {
    let bind = if read_only {
        BindMount::read_only(staged_dir, SOURCE_MOUNT_POINT)
    } else {
        BindMount::new(staged_dir, SOURCE_MOUNT_POINT)
    };
    CommandOptions::new(interpreter)
        .with_args(vec![format!("{}/{}", SOURCE_MOUNT_POINT, SCRIPT_FILE_NAME)])
        .with_bind(bind)
        .with_working_dir(SOURCE_MOUNT_POINT)
}

/*!
 * Sandbox Subsystem
 * Multi-backend command isolation behind one capability contract
 *
 * Flow: probe -> construct with configuration -> run / run_source -> clear
 */

pub mod backends;
pub mod context;
pub mod exec;
pub mod factory;
pub mod probe;
pub mod staging;
pub mod traits;
pub mod types;

pub use backends::{
    BubblewrapConfig, DarwinSeatbelt, DockerConfig, DockerContainer, LinuxBubblewrap,
    LinuxSystemdRun, SeatbeltConfig, SystemdRunConfig, Unsupported, WindowsSandbox,
    WindowsSandboxConfig,
};
pub use context::{CancelToken, ExecContext, Interrupt};
pub use factory::{create, create_or_unsupported, BackendConfig};
pub use probe::{lookup_executable, probe_all, probe_for, ProbeReport};
pub use traits::{CapabilityProbe, Sandbox};
pub use types::{
    BackendKind, BindMount, CommandOptions, ExecutionResult, InstanceState, ProbeStatus,
};

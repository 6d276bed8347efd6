/*!
 * Sandboxer Library
 * Sandboxed command execution across seatbelt, systemd-run, bubblewrap,
 * Windows Sandbox and Docker
 */

pub mod config;
pub mod core;
pub mod monitoring;
pub mod sandbox;

// Re-exports
pub use crate::core::errors::{SandboxError, SandboxResult};
pub use config::{load_backend_config, Settings};
pub use monitoring::init_tracing;
pub use sandbox::{
    create, create_or_unsupported, BackendConfig, BackendKind, BindMount, CancelToken,
    CapabilityProbe, CommandOptions, ExecContext, ExecutionResult, InstanceState, ProbeStatus,
    Sandbox,
};

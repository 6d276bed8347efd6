/*!
 * Error Types
 * Centralized sandbox error taxonomy with thiserror, miette, and serde support
 */

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sandbox operation result
///
/// # Must Use
/// Sandbox operations can fail and must be handled
#[must_use = "sandbox operations can fail and must be handled"]
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Unified sandbox error type
///
/// A non-zero exit of the sandboxed command is not an error by itself: it is
/// carried inside `ExecutionResult`. `RuntimeFailure` only appears when a
/// caller explicitly asks for success via `ExecutionResult::ensure_success`.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum SandboxError {
    #[error("Backend not installed: {0}")]
    #[diagnostic(
        code(sandbox::not_installed),
        help("Install the backend tool and make sure it is on PATH.")
    )]
    NotInstalled(String),

    #[error("Backend not enabled: {0}")]
    #[diagnostic(
        code(sandbox::not_enabled),
        help("The tool is present but inactive. Start its daemon or enable the OS feature.")
    )]
    NotEnabled(String),

    #[error("Invalid configuration: {0}")]
    #[diagnostic(
        code(sandbox::config_invalid),
        help("Review the rule set and options. No process was started.")
    )]
    ConfigInvalid(String),

    #[error("Staging failed: {0}")]
    #[diagnostic(
        code(sandbox::stage_failure),
        help("Temporary file or directory I/O failed. Check the temp dir and disk space.")
    )]
    StageFailure(String),

    #[error("Launch failed: {0}")]
    #[diagnostic(
        code(sandbox::launch_failure),
        help("The sandbox launcher could not be started.")
    )]
    LaunchFailure(String),

    #[error("Command {command:?} exited unsuccessfully (code {code:?})")]
    #[diagnostic(
        code(sandbox::runtime_failure),
        help("Inspect the captured stderr of the execution result.")
    )]
    RuntimeFailure { command: String, code: Option<i32> },

    #[error("Timeout: {0}")]
    #[diagnostic(
        code(sandbox::timeout),
        help("The execution deadline fired and the sandboxed process was killed.")
    )]
    Timeout(String),

    #[error("Cancelled: {0}")]
    #[diagnostic(
        code(sandbox::cancelled),
        help("The caller cancelled the execution and the sandboxed process was killed.")
    )]
    Cancelled(String),

    #[error("Cleanup failed: {0}")]
    #[diagnostic(
        code(sandbox::cleanup_failure),
        help("Some temporary resources could not be removed and may need manual cleanup.")
    )]
    CleanupFailure(String),

    #[error("Not implemented: {0}")]
    #[diagnostic(
        code(sandbox::not_implemented),
        help("This operation is not supported by this backend or platform.")
    )]
    NotImplemented(String),

    #[error("Not a toggle-able feature: {0}")]
    #[diagnostic(
        code(sandbox::not_toggleable),
        help("This isolation feature is built into the platform and cannot be switched on or off.")
    )]
    NotToggleable(String),

    #[error("Invalid instance state: {0}")]
    #[diagnostic(code(sandbox::invalid_state))]
    InvalidState(String),

    #[error("Container engine error: {0}")]
    #[diagnostic(
        code(sandbox::engine),
        help("The container engine rejected a request. Check the daemon logs.")
    )]
    Engine(String),

    #[error("Sandbox instance already cleared: {0}")]
    #[diagnostic(
        code(sandbox::cleared),
        help("Create a new sandbox instance; cleared instances cannot be reused.")
    )]
    Cleared(String),
}

impl SandboxError {
    /// True for errors raised before any process was spawned
    pub fn is_config_invalid(&self) -> bool {
        matches!(self, SandboxError::ConfigInvalid(_))
    }

    /// True when the caller's deadline or cancellation ended the call
    pub fn is_interrupted(&self) -> bool {
        matches!(self, SandboxError::Timeout(_) | SandboxError::Cancelled(_))
    }

    /// True when the backend is missing or inactive
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            SandboxError::NotInstalled(_) | SandboxError::NotEnabled(_)
        )
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        SandboxError::StageFailure(err.to_string())
    }
}

impl From<serde_json::Error> for SandboxError {
    fn from(err: serde_json::Error) -> Self {
        SandboxError::ConfigInvalid(err.to_string())
    }
}

/*!
 * Sandbox Types
 * Backend-agnostic types shared by every sandbox backend
 */

use crate::core::errors::{SandboxError, SandboxResult};
use crate::core::serde::{is_false, is_none};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// One concrete isolation technology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// macOS seatbelt profile via sandbox-exec
    Seatbelt,
    /// Linux transient user unit via systemd-run
    SystemdRun,
    /// Linux namespaces via bwrap
    Bubblewrap,
    /// Windows Sandbox disposable VM
    WindowsSandbox,
    /// Docker container
    Docker,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Seatbelt,
        BackendKind::SystemdRun,
        BackendKind::Bubblewrap,
        BackendKind::WindowsSandbox,
        BackendKind::Docker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Seatbelt => "seatbelt",
            BackendKind::SystemdRun => "systemd_run",
            BackendKind::Bubblewrap => "bubblewrap",
            BackendKind::WindowsSandbox => "windows_sandbox",
            BackendKind::Docker => "docker",
        }
    }

    /// Whether the backend can exist on the given `std::env::consts::OS` value
    pub fn supported_on(&self, os: &str) -> bool {
        match self {
            BackendKind::Seatbelt => os == "macos",
            BackendKind::SystemdRun | BackendKind::Bubblewrap => os == "linux",
            BackendKind::WindowsSandbox => os == "windows",
            BackendKind::Docker => true,
        }
    }

    /// Whether the backend can exist on the running OS
    pub fn supported_here(&self) -> bool {
        self.supported_on(std::env::consts::OS)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instance-level state machine
///
/// `Probed -> Configured -> Running -> Cleared`; `Cleared` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Capability confirmed, nothing allocated yet
    Probed,
    /// Policy compiled and instance resources allocated
    Configured,
    /// At least one run has been issued
    Running,
    /// Every resource released
    Cleared,
}

/// Exposes a host path inside the sandbox boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub host_path: PathBuf,
    pub sandbox_path: PathBuf,
    #[serde(default, skip_serializing_if = "is_false")]
    pub read_only: bool,
}

impl BindMount {
    pub fn new(host_path: impl Into<PathBuf>, sandbox_path: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host_path.into(),
            sandbox_path: sandbox_path.into(),
            read_only: false,
        }
    }

    pub fn read_only(host_path: impl Into<PathBuf>, sandbox_path: impl Into<PathBuf>) -> Self {
        Self {
            read_only: true,
            ..Self::new(host_path, sandbox_path)
        }
    }

    /// Absolute, normalized host path; `None` when the path cannot be resolved
    ///
    /// Callers skip binds that do not resolve rather than binding a different path.
    pub fn resolved_host_path(&self) -> Option<PathBuf> {
        resolve_host_path(&self.host_path)
    }
}

/// Resolve a host path to an absolute canonical path
pub fn resolve_host_path(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    let cleaned = path_clean::clean(&absolute);
    cleaned.canonicalize().ok()
}

/// Per-call execution options
///
/// Binds and environment are unioned with the instance's static ones at
/// execution time; per-call entries win on the same target path or key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandOptions {
    pub command: String,
    pub args: Vec<String>,
    pub binds: Vec<BindMount>,
    #[serde(skip_serializing_if = "is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "is_none")]
    pub chdir: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "is_none")]
    pub stdin: Option<String>,
}

impl CommandOptions {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Split a command line on whitespace; no shell quoting is honored
    pub fn from_command_line(cmd: &str) -> SandboxResult<Self> {
        let mut parts = cmd.split_whitespace().map(str::to_string);
        let command = parts
            .next()
            .ok_or_else(|| SandboxError::ConfigInvalid("empty command".to_string()))?;
        Ok(Self::new(command).with_args(parts.collect()))
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_bind(mut self, bind: BindMount) -> Self {
        self.binds.push(bind);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_chdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.chdir = Some(dir.into());
        self
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Reject options that must never reach a process spawn
    pub fn validate(&self) -> SandboxResult<()> {
        if self.command.trim().is_empty() {
            return Err(SandboxError::ConfigInvalid(
                "command cannot be empty".to_string(),
            ));
        }
        for key in self.environment.keys() {
            validate_env_key(key)?;
        }
        Ok(())
    }

    /// Directory the command should start in: explicit chdir, else working dir
    pub fn effective_dir(&self) -> Option<&Path> {
        self.chdir.as_deref().or(self.working_dir.as_deref())
    }

    /// Command followed by its arguments
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.command.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// Environment keys must be non-empty and free of `=` and NUL
pub fn validate_env_key(key: &str) -> SandboxResult<()> {
    if key.is_empty() || key.contains('=') || key.contains('\0') {
        return Err(SandboxError::ConfigInvalid(format!(
            "invalid environment variable name {:?}",
            key
        )));
    }
    Ok(())
}

/// Merge static and per-call environment; per-call wins
pub fn merge_environment(
    base: &BTreeMap<String, String>,
    overlay: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = base.clone();
    merged.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Outcome of one sandboxed execution
///
/// `exit_code` is only meaningful because a process actually ran: launch
/// failures never produce an `ExecutionResult`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Full launcher invocation, for diagnostics
    pub command: String,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    /// Description of an unsuccessful exit
    #[serde(skip_serializing_if = "is_none")]
    pub exit_error: Option<String>,
}

impl ExecutionResult {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Exit code, or `default` when terminated by a signal
    pub fn exit_code_or(&self, default: i32) -> i32 {
        self.exit_code.unwrap_or(default)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Record the exit status reported by the launcher or engine
    pub fn set_exit(&mut self, code: Option<i32>, description: Option<String>) {
        self.exit_code = code;
        self.exit_error = match code {
            Some(0) => None,
            Some(code) => Some(description.unwrap_or_else(|| format!("exit status {}", code))),
            None => Some(description.unwrap_or_else(|| "terminated by signal".to_string())),
        };
    }

    /// Turn a non-zero exit into `RuntimeFailure`
    pub fn ensure_success(self) -> SandboxResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(SandboxError::RuntimeFailure {
                command: self.command.clone(),
                code: self.exit_code,
            })
        }
    }
}

/// Result of an `is_installed` / `is_enabled` probe
///
/// "Not found" is data, not an `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeStatus {
    pub available: bool,
    #[serde(skip_serializing_if = "is_none")]
    pub error: Option<SandboxError>,
}

impl ProbeStatus {
    pub fn available() -> Self {
        Self {
            available: true,
            error: None,
        }
    }

    pub fn unavailable(error: SandboxError) -> Self {
        Self {
            available: false,
            error: Some(error),
        }
    }

    pub fn from_result<T>(result: SandboxResult<T>) -> Self {
        match result {
            Ok(_) => Self::available(),
            Err(e) => Self::unavailable(e),
        }
    }

    /// `Ok` when available, else the recorded error
    pub fn into_result(self) -> SandboxResult<()> {
        match (self.available, self.error) {
            (true, _) => Ok(()),
            (false, Some(e)) => Err(e),
            (false, None) => Err(SandboxError::NotEnabled("probe failed".to_string())),
        }
    }
}

/// Instance state shared by every backend
///
/// The lock is only held for the state transition itself, never across a run.
#[derive(Debug)]
pub struct Lifecycle {
    kind: BackendKind,
    state: Mutex<InstanceState>,
}

impl Lifecycle {
    pub fn new(kind: BackendKind, state: InstanceState) -> Self {
        Self {
            kind,
            state: Mutex::new(state),
        }
    }

    pub fn state(&self) -> InstanceState {
        *self.state.lock()
    }

    /// Fail fast with `Cleared` once the instance has been torn down
    pub fn ensure_active(&self) -> SandboxResult<()> {
        if *self.state.lock() == InstanceState::Cleared {
            return Err(SandboxError::Cleared(self.kind.to_string()));
        }
        Ok(())
    }

    /// Transition into `Running` for one run
    pub fn enter_run(&self) -> SandboxResult<()> {
        let mut state = self.state.lock();
        if *state == InstanceState::Cleared {
            return Err(SandboxError::Cleared(self.kind.to_string()));
        }
        *state = InstanceState::Running;
        Ok(())
    }

    /// Mark the instance cleared; returns false if it already was
    pub fn mark_cleared(&self) -> bool {
        let mut state = self.state.lock();
        let first = *state != InstanceState::Cleared;
        *state = InstanceState::Cleared;
        first
    }
}

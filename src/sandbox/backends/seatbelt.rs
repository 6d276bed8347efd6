/*!
 * macOS Seatbelt Backend
 * Compiles rules into an SBPL profile and runs commands under sandbox-exec
 */

use super::run_traced;
use crate::core::errors::{SandboxError, SandboxResult};
use crate::core::limits::DEFAULT_SCRIPT_INTERPRETER;
use crate::monitoring::{trace_compiled, trace_instance_created};
use crate::sandbox::context::ExecContext;
use crate::sandbox::exec::ProcessSpec;
use crate::sandbox::probe::lookup_executable;
use crate::sandbox::staging::{InstanceDir, InstanceSlot};
use crate::sandbox::traits::{CapabilityProbe, Sandbox};
use crate::sandbox::types::{
    BackendKind, CommandOptions, ExecutionResult, InstanceState, Lifecycle, ProbeStatus,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

const LAUNCHER: &str = "sandbox-exec";
const PROFILE_FILE_NAME: &str = "config.sb";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Allow,
    Deny,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Deny => "deny",
        }
    }
}

/// Operation family a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Network,
    FileWrite,
    FileRead,
    Process,
    Default,
}

impl Scope {
    /// `default` is an operation of its own; the others are prefix wildcards
    fn render(&self) -> &'static str {
        match self {
            Scope::Network => "network*",
            Scope::FileWrite => "file-write*",
            Scope::FileRead => "file-read*",
            Scope::Process => "process*",
            Scope::Default => "default",
        }
    }
}

/// Filter argument of a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SeatbeltArg {
    Subpath(PathBuf),
    Literal(PathBuf),
    Regex(String),
    LocalIp(String),
    RemoteIp(String),
}

impl SeatbeltArg {
    fn render(&self) -> SandboxResult<String> {
        Ok(match self {
            SeatbeltArg::Subpath(path) => format!("(subpath \"{}\")", sbpl_path(path)?),
            SeatbeltArg::Literal(path) => format!("(literal \"{}\")", sbpl_path(path)?),
            SeatbeltArg::Regex(pattern) => format!("(regex #\"{}\")", sbpl_string(pattern)?),
            SeatbeltArg::LocalIp(addr) => format!("(local ip \"{}\")", sbpl_string(addr)?),
            SeatbeltArg::RemoteIp(addr) => format!("(remote ip \"{}\")", sbpl_string(addr)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatbeltRule {
    pub action: Action,
    pub scope: Scope,
    #[serde(default)]
    pub args: Vec<SeatbeltArg>,
}

impl SeatbeltRule {
    pub fn new(action: Action, scope: Scope) -> Self {
        Self {
            action,
            scope,
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: SeatbeltArg) -> Self {
        self.args.push(arg);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeatbeltConfig {
    /// Applied in order; the evaluator prefers later rules on conflict
    pub rules: Vec<SeatbeltRule>,
    /// Parent of the instance directory holding the profile
    pub temp_dir: Option<PathBuf>,
}

fn sbpl_string(value: &str) -> SandboxResult<&str> {
    if value.contains('"') || value.contains('\n') || value.contains('\r') {
        return Err(SandboxError::ConfigInvalid(format!(
            "seatbelt argument {:?} contains a quote or newline",
            value
        )));
    }
    Ok(value)
}

fn sbpl_path(path: &Path) -> SandboxResult<&str> {
    let value = path.to_str().ok_or_else(|| {
        SandboxError::ConfigInvalid(format!("seatbelt path {:?} is not valid UTF-8", path))
    })?;
    sbpl_string(value)
}

/// Render the SBPL profile text
///
/// Output depends only on `rules`; one rule per line after the fixed header.
pub fn compile_profile(rules: &[SeatbeltRule]) -> SandboxResult<String> {
    let mut profile = String::from("(version 1)\n(allow default)\n");
    for rule in rules {
        let mut line = format!("({} {}", rule.action.as_str(), rule.scope.render());
        for arg in &rule.args {
            line.push(' ');
            line.push_str(&arg.render()?);
        }
        line.push(')');
        // Writing to a String cannot fail
        let _ = writeln!(profile, "{}", line);
    }
    Ok(profile)
}

/// `sandbox-exec` ships with macOS and cannot be toggled
#[derive(Debug, Clone, Copy, Default)]
pub struct SeatbeltProbe;

#[async_trait]
impl CapabilityProbe for SeatbeltProbe {
    fn kind(&self) -> BackendKind {
        BackendKind::Seatbelt
    }

    async fn is_installed(&self) -> ProbeStatus {
        ProbeStatus::from_result(lookup_executable(LAUNCHER))
    }

    async fn is_enabled(&self) -> ProbeStatus {
        self.is_installed().await
    }
}

/// Seatbelt instance; the profile is compiled once at construction
#[derive(Debug)]
pub struct DarwinSeatbelt {
    config: SeatbeltConfig,
    profile_path: PathBuf,
    instance: InstanceSlot,
    lifecycle: Lifecycle,
}

impl DarwinSeatbelt {
    pub async fn new(config: SeatbeltConfig) -> SandboxResult<Self> {
        SeatbeltProbe.ensure_available().await?;
        Self::from_config(config)
    }

    /// Compile and write the profile without probing
    pub(crate) fn from_config(config: SeatbeltConfig) -> SandboxResult<Self> {
        let profile = compile_profile(&config.rules)?;
        trace_compiled(BackendKind::Seatbelt.as_str(), &profile);

        let instance = InstanceDir::create(BackendKind::Seatbelt.as_str(), config.temp_dir.as_deref())?;
        let profile_path = instance.write_file(PROFILE_FILE_NAME, profile.as_bytes(), 0o600)?;
        trace_instance_created(BackendKind::Seatbelt.as_str());

        Ok(Self {
            config,
            profile_path,
            instance: InstanceSlot::new(instance),
            lifecycle: Lifecycle::new(BackendKind::Seatbelt, InstanceState::Configured),
        })
    }

    pub fn config(&self) -> &SeatbeltConfig {
        &self.config
    }

    pub fn profile_path(&self) -> &Path {
        &self.profile_path
    }

    /// `sandbox-exec -f <profile> <command> <args…>`
    pub fn compile_invocation(&self, options: &CommandOptions) -> SandboxResult<ProcessSpec> {
        options.validate()?;
        if !options.binds.is_empty() {
            return Err(SandboxError::ConfigInvalid(
                "seatbelt cannot remap paths; per-call binds are not supported".to_string(),
            ));
        }

        let mut spec = ProcessSpec::new(LAUNCHER)
            .with_args(["-f".to_string(), self.profile_path.display().to_string()])
            .with_args(options.argv())
            .with_stdin(options.stdin.clone());
        spec.env = options.environment.clone();
        if let Some(dir) = options.effective_dir() {
            spec = spec.with_current_dir(dir);
        }
        Ok(spec)
    }
}

#[async_trait]
impl Sandbox for DarwinSeatbelt {
    fn kind(&self) -> BackendKind {
        BackendKind::Seatbelt
    }

    fn state(&self) -> InstanceState {
        self.lifecycle.state()
    }

    async fn run_with_options(
        &self,
        ctx: &ExecContext,
        options: CommandOptions,
    ) -> SandboxResult<ExecutionResult> {
        self.lifecycle.ensure_active()?;
        let spec = self.compile_invocation(&options)?;
        self.lifecycle.enter_run()?;
        run_traced(BackendKind::Seatbelt, "run", &spec, ctx).await
    }

    async fn run_source(&self, ctx: &ExecContext, source: &str) -> SandboxResult<ExecutionResult> {
        self.lifecycle.enter_run()?;
        let staged = self.instance.stage(source)?;

        // No path remapping: the script runs from its host location
        let options = CommandOptions::new(DEFAULT_SCRIPT_INTERPRETER)
            .with_args(vec![staged.script_path().display().to_string()])
            .with_chdir(staged.dir());
        let outcome = match self.compile_invocation(&options) {
            Ok(spec) => run_traced(BackendKind::Seatbelt, "run_source", &spec, ctx).await,
            Err(e) => Err(e),
        };
        staged.cleanup();
        outcome
    }

    async fn clear(&self) -> SandboxResult<()> {
        if self.lifecycle.mark_cleared() {
            info!(backend = BackendKind::Seatbelt.as_str(), "clearing sandbox instance");
        }
        self.instance.close()
    }
}

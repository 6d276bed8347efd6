/*!
 * Linux Bubblewrap Backend
 * Builds a fresh namespace sandbox per command with bwrap
 *
 * Mount order matters: bwrap applies mounts left to right and later
 * mounts shadow earlier ones, so the empty root comes first and per-call
 * binds come after static ones.
 */

use super::{run_traced, staged_script_options};
use crate::core::errors::{SandboxError, SandboxResult};
use crate::core::limits::{BWRAP_HOST_SYSTEM_DIRS, DEFAULT_SCRIPT_INTERPRETER};
use crate::core::serde::{is_empty_vec, is_false, is_zero_u32};
use crate::monitoring::{trace_compiled, trace_instance_created};
use crate::sandbox::context::ExecContext;
use crate::sandbox::exec::ProcessSpec;
use crate::sandbox::probe::{lookup_executable, require_probe_success};
use crate::sandbox::staging::{release_dir, InstanceDir, InstanceSlot};
use crate::sandbox::traits::{CapabilityProbe, Sandbox};
use crate::sandbox::types::{
    merge_environment, validate_env_key, BackendKind, BindMount, CommandOptions, ExecutionResult,
    InstanceState, Lifecycle, ProbeStatus,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const LAUNCHER: &str = "bwrap";
const ROOT_DIR_PREFIX: &str = "root_";

/// Symlink created inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symlink {
    pub target: PathBuf,
    pub link: PathBuf,
}

/// Static options applied to every command
///
/// `--unshare-all` is always passed, so the `unshare_*` flags only add
/// explicit per-namespace arguments on top of it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BubblewrapConfig {
    /// Parent of the instance directory; OS temp dir when unset
    pub temp_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "is_false")]
    pub unshare_pid: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub unshare_ipc: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub unshare_network: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub unshare_uts: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub unshare_user: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub unshare_cgroup: bool,

    /// New terminal session (blocks TIOCSTI injection)
    #[serde(skip_serializing_if = "is_false")]
    pub new_session: bool,
    /// Only applied with a user namespace and when non-zero
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub uid: u32,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub gid: u32,

    /// Always mounted read-only, whatever their own flag says
    #[serde(skip_serializing_if = "is_empty_vec")]
    pub read_only_binds: Vec<BindMount>,
    #[serde(skip_serializing_if = "is_empty_vec")]
    pub symlinks: Vec<Symlink>,
    pub environment: BTreeMap<String, String>,

    /// Expose the host's system directories read-only
    #[serde(skip_serializing_if = "is_false")]
    pub host_filesystem: bool,
}

impl BubblewrapConfig {
    fn validate(&self) -> SandboxResult<()> {
        for key in self.environment.keys() {
            validate_env_key(key)?;
        }
        for symlink in &self.symlinks {
            if symlink.target.as_os_str().is_empty() || symlink.link.as_os_str().is_empty() {
                return Err(SandboxError::ConfigInvalid(
                    "symlink target and link must be non-empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn push_bind(args: &mut Vec<String>, flag: &str, bind: &BindMount) {
    match bind.resolved_host_path() {
        Some(host) => {
            args.push(flag.to_string());
            args.push(host.display().to_string());
            args.push(bind.sandbox_path.display().to_string());
        }
        None => {
            debug!(host = %bind.host_path.display(), "skipping unresolvable bind");
        }
    }
}

/// Full bwrap argument vector for one command, excluding the launcher name
pub fn compile_bwrap_args(
    config: &BubblewrapConfig,
    root: &Path,
    options: &CommandOptions,
) -> Vec<String> {
    let mut args: Vec<String> = ["--unshare-all", "--die-with-parent"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    args.extend(["--bind".to_string(), root.display().to_string(), "/".to_string()]);
    for (flag, target) in [
        ("--proc", "/proc"),
        ("--dev", "/dev"),
        ("--tmpfs", "/tmp"),
        ("--tmpfs", "/run"),
    ] {
        args.push(flag.to_string());
        args.push(target.to_string());
    }

    for (enabled, flag) in [
        (config.unshare_pid, "--unshare-pid"),
        (config.unshare_ipc, "--unshare-ipc"),
        (config.unshare_network, "--unshare-net"),
        (config.unshare_uts, "--unshare-uts"),
        (config.unshare_user, "--unshare-user"),
        (config.unshare_cgroup, "--unshare-cgroup"),
    ] {
        if enabled {
            args.push(flag.to_string());
        }
    }

    if config.new_session {
        args.push("--new-session".to_string());
    }

    if config.unshare_user {
        if config.uid > 0 {
            args.push("--uid".to_string());
            args.push(config.uid.to_string());
        }
        if config.gid > 0 {
            args.push("--gid".to_string());
            args.push(config.gid.to_string());
        }
    }

    if config.host_filesystem {
        for dir in BWRAP_HOST_SYSTEM_DIRS {
            if Path::new(dir).exists() {
                args.push("--ro-bind".to_string());
                args.push(dir.to_string());
                args.push(dir.to_string());
            }
        }
    }

    for bind in &config.read_only_binds {
        push_bind(&mut args, "--ro-bind", bind);
    }

    for symlink in &config.symlinks {
        args.push("--symlink".to_string());
        args.push(symlink.target.display().to_string());
        args.push(symlink.link.display().to_string());
    }

    for (key, value) in merge_environment(&config.environment, &options.environment) {
        args.push("--setenv".to_string());
        args.push(key);
        args.push(value);
    }

    for bind in &options.binds {
        let flag = if bind.read_only { "--ro-bind" } else { "--bind" };
        push_bind(&mut args, flag, bind);
    }

    if let Some(dir) = options.effective_dir() {
        args.push("--chdir".to_string());
        args.push(dir.display().to_string());
    }

    args.extend(options.argv());
    args
}

/// Needs bwrap itself and permission to create user namespaces
#[derive(Debug, Clone, Copy, Default)]
pub struct BubblewrapProbe;

#[async_trait]
impl CapabilityProbe for BubblewrapProbe {
    fn kind(&self) -> BackendKind {
        BackendKind::Bubblewrap
    }

    async fn is_installed(&self) -> ProbeStatus {
        let located = match lookup_executable(LAUNCHER) {
            Ok(path) => path,
            Err(e) => return ProbeStatus::unavailable(e),
        };
        let version = require_probe_success(LAUNCHER, &["--version"], "bwrap --version")
            .await
            .map_err(|e| {
                SandboxError::NotInstalled(format!("{} is not runnable: {}", located.display(), e))
            });
        ProbeStatus::from_result(version)
    }

    async fn is_enabled(&self) -> ProbeStatus {
        let installed = self.is_installed().await;
        if !installed.available {
            return installed;
        }
        ProbeStatus::from_result(
            require_probe_success(LAUNCHER, &["--ro-bind", "/", "/", "true"], "namespace sandbox")
                .await,
        )
    }
}

/// Bubblewrap instance; arguments are compiled per call
#[derive(Debug)]
pub struct LinuxBubblewrap {
    config: BubblewrapConfig,
    instance: InstanceSlot,
    lifecycle: Lifecycle,
}

impl LinuxBubblewrap {
    pub async fn new(config: BubblewrapConfig) -> SandboxResult<Self> {
        BubblewrapProbe.ensure_available().await?;
        Self::from_config(config)
    }

    pub(crate) fn from_config(config: BubblewrapConfig) -> SandboxResult<Self> {
        config.validate()?;
        let instance = InstanceDir::create(BackendKind::Bubblewrap.as_str(), config.temp_dir.as_deref())?;
        trace_instance_created(BackendKind::Bubblewrap.as_str());

        Ok(Self {
            config,
            instance: InstanceSlot::new(instance),
            lifecycle: Lifecycle::new(BackendKind::Bubblewrap, InstanceState::Configured),
        })
    }

    pub fn config(&self) -> &BubblewrapConfig {
        &self.config
    }

    /// Instance directory holding per-call roots and staged sources
    pub fn instance_path(&self) -> Option<PathBuf> {
        self.instance.path()
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        options: &CommandOptions,
        operation: &'static str,
    ) -> SandboxResult<ExecutionResult> {
        let root = self.instance.scratch_dir(ROOT_DIR_PREFIX)?;
        let args = compile_bwrap_args(&self.config, root.path(), options);
        trace_compiled(BackendKind::Bubblewrap.as_str(), &args.join(" "));

        let spec = ProcessSpec::new(LAUNCHER)
            .with_args(args)
            .with_stdin(options.stdin.clone());
        let outcome = run_traced(BackendKind::Bubblewrap, operation, &spec, ctx).await;
        release_dir(root);
        outcome
    }
}

#[async_trait]
impl Sandbox for LinuxBubblewrap {
    fn kind(&self) -> BackendKind {
        BackendKind::Bubblewrap
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
        options.validate()?;
        self.lifecycle.enter_run()?;
        self.execute(ctx, &options, "run").await
    }

    async fn run_source(&self, ctx: &ExecContext, source: &str) -> SandboxResult<ExecutionResult> {
        self.lifecycle.enter_run()?;
        let staged = self.instance.stage(source)?;
        let options = staged_script_options(staged.dir(), DEFAULT_SCRIPT_INTERPRETER, false);
        let outcome = self.execute(ctx, &options, "run_source").await;
        staged.cleanup();
        outcome
    }

    async fn clear(&self) -> SandboxResult<()> {
        if self.lifecycle.mark_cleared() {
            info!(backend = BackendKind::Bubblewrap.as_str(), "clearing sandbox instance");
        }
        self.instance.close()
    }
}

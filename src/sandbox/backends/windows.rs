/*!
 * Windows Sandbox Backend
 * Compiles a .wsb descriptor and supervises the disposable VM process
 *
 * Commands cannot be executed inside the guest without an in-guest agent,
 * so `run`/`run_source` are not implemented; the VM is driven via
 * `start`/`wait`/`stop`.
 */

use crate::core::errors::{SandboxError, SandboxResult};
use crate::core::limits::{
    FEATURE_TOGGLE_TIMEOUT, WINDOWS_DEFAULT_MOUNT_POINT, WINDOWS_DISABLE_FIREWALL_COMMAND,
    WINDOWS_SANDBOX_FEATURE,
};
use crate::core::serde::{is_empty_vec, is_false, is_none, is_zero_u32};
use crate::monitoring::{trace_compiled, trace_instance_created};
use crate::sandbox::context::ExecContext;
use crate::sandbox::exec::{execute, ProcessSpec};
use crate::sandbox::probe::{lookup_executable, run_probe_command};
use crate::sandbox::staging::{InstanceDir, InstanceSlot};
use crate::sandbox::traits::{CapabilityProbe, Sandbox};
use crate::sandbox::types::{
    BackendKind, CommandOptions, ExecutionResult, InstanceState, Lifecycle, ProbeStatus,
};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, warn};

const LAUNCHER: &str = "WindowsSandbox.exe";
const POWERSHELL: &str = "powershell";
const DESCRIPTOR_FILE_NAME: &str = "config.wsb";
const SHARED_FOLDER_NAME: &str = "shared";

/// Tri-state descriptor switch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum Toggle {
    Enable,
    Disable,
    #[default]
    Default,
}

impl Toggle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Toggle::Enable => "Enable",
            Toggle::Disable => "Disable",
            Toggle::Default => "Default",
        }
    }
}

impl Serialize for Toggle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Host folder shared with the guest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedFolder {
    pub host_folder: PathBuf,
    /// Guest path; the guest desktop when unset
    #[serde(default, skip_serializing_if = "is_none")]
    pub sandbox_folder: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowsSandboxConfig {
    #[serde(skip_serializing_if = "is_empty_vec")]
    pub mapped_folders: Vec<MappedFolder>,
    pub networking: Toggle,
    /// Run at guest logon, in order
    #[serde(skip_serializing_if = "is_empty_vec")]
    pub logon_commands: Vec<String>,
    pub virtual_gpu: Toggle,
    pub protected_client: Toggle,
    /// Omitted from the descriptor when zero
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub memory_in_mb: u32,
    #[serde(skip_serializing_if = "is_empty_vec")]
    pub ips: Vec<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub disable_firewall: bool,
    pub temp_dir: Option<PathBuf>,
}

// Descriptor document; element names follow the .wsb schema

#[derive(Serialize)]
#[serde(rename = "Configuration")]
struct Descriptor {
    #[serde(rename = "MappedFolders")]
    mapped_folders: DescriptorFolders,
    #[serde(rename = "Networking")]
    networking: Toggle,
    #[serde(rename = "LogonCommand", skip_serializing_if = "DescriptorCommands::is_empty")]
    logon_command: DescriptorCommands,
    #[serde(rename = "vGPU")]
    virtual_gpu: Toggle,
    #[serde(rename = "ProtectedClient")]
    protected_client: Toggle,
    #[serde(rename = "MemoryInMB", skip_serializing_if = "is_zero_u32")]
    memory_in_mb: u32,
    #[serde(rename = "Ips", skip_serializing_if = "DescriptorIps::is_empty")]
    ips: DescriptorIps,
}

#[derive(Serialize)]
struct DescriptorFolders {
    #[serde(rename = "MappedFolder")]
    folders: Vec<DescriptorFolder>,
}

#[derive(Serialize)]
struct DescriptorFolder {
    #[serde(rename = "HostFolder")]
    host_folder: String,
    #[serde(rename = "SandboxFolder", skip_serializing_if = "is_none")]
    sandbox_folder: Option<String>,
    #[serde(rename = "ReadOnly", skip_serializing_if = "is_false")]
    read_only: bool,
}

#[derive(Serialize)]
struct DescriptorCommands {
    #[serde(rename = "Command")]
    commands: Vec<String>,
}

impl DescriptorCommands {
    fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[derive(Serialize)]
struct DescriptorIps {
    #[serde(rename = "IP")]
    ips: Vec<String>,
}

impl DescriptorIps {
    fn is_empty(&self) -> bool {
        self.ips.is_empty()
    }
}

/// Render the .wsb XML
///
/// The shared folder is appended to the mapped folders, the firewall
/// command to the logon commands and `host_ips` after user-supplied IPs.
pub fn compile_descriptor(
    config: &WindowsSandboxConfig,
    shared_folder: &Path,
    host_ips: &[String],
) -> SandboxResult<String> {
    let mut folders: Vec<DescriptorFolder> = config
        .mapped_folders
        .iter()
        .map(|folder| DescriptorFolder {
            host_folder: folder.host_folder.display().to_string(),
            sandbox_folder: folder
                .sandbox_folder
                .as_ref()
                .map(|path| path.display().to_string()),
            read_only: folder.read_only,
        })
        .collect();
    folders.push(DescriptorFolder {
        host_folder: shared_folder.display().to_string(),
        sandbox_folder: None,
        read_only: false,
    });

    let mut commands = config.logon_commands.clone();
    if config.disable_firewall {
        commands.push(WINDOWS_DISABLE_FIREWALL_COMMAND.to_string());
    }

    let mut ips = config.ips.clone();
    ips.extend(host_ips.iter().cloned());

    let descriptor = Descriptor {
        mapped_folders: DescriptorFolders { folders },
        networking: config.networking,
        logon_command: DescriptorCommands { commands },
        virtual_gpu: config.virtual_gpu,
        protected_client: config.protected_client,
        memory_in_mb: config.memory_in_mb,
        ips: DescriptorIps { ips },
    };

    quick_xml::se::to_string(&descriptor)
        .map_err(|e| SandboxError::ConfigInvalid(format!("descriptor serialization: {}", e)))
}

/// Addresses of every host interface
pub fn host_addresses() -> SandboxResult<Vec<String>> {
    let interfaces = if_addrs::get_if_addrs()
        .map_err(|e| SandboxError::StageFailure(format!("enumerate host interfaces: {}", e)))?;
    Ok(interfaces
        .iter()
        .map(|iface| iface.ip().to_string())
        .collect())
}

/// Probe and toggle the Containers-DisposableClientVM optional feature
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsSandboxProbe;

impl WindowsSandboxProbe {
    async fn feature_command(verb: &str, extra: &[&str]) -> SandboxResult<ExecutionResult> {
        lookup_executable(POWERSHELL)?;
        let feature = format!("\"{}\"", WINDOWS_SANDBOX_FEATURE);
        let spec = ProcessSpec::new(POWERSHELL)
            .with_args([verb, "-FeatureName", feature.as_str(), "-Online"])
            .with_args(extra.iter().copied());
        let result = execute(&spec, &ExecContext::with_timeout(FEATURE_TOGGLE_TIMEOUT)).await?;
        result.ensure_success()
    }

    async fn feature_enabled() -> SandboxResult<()> {
        lookup_executable(POWERSHELL)?;
        let feature = format!("\"{}\"", WINDOWS_SANDBOX_FEATURE);
        let result = run_probe_command(
            POWERSHELL,
            &["Get-WindowsOptionalFeature", "-FeatureName", feature.as_str(), "-Online"],
        )
        .await?;
        if feature_state_enabled(&result.stdout_lossy())? {
            Ok(())
        } else {
            Err(SandboxError::NotEnabled(format!(
                "optional feature {} is disabled",
                WINDOWS_SANDBOX_FEATURE
            )))
        }
    }
}

/// `State : Enabled` anywhere in Get-WindowsOptionalFeature output
pub(crate) fn feature_state_enabled(output: &str) -> SandboxResult<bool> {
    let pattern = Regex::new(r"(?m)State\s*:\s*Enabled")
        .map_err(|e| SandboxError::InvalidState(format!("feature state pattern: {}", e)))?;
    Ok(pattern.is_match(output))
}

#[async_trait]
impl CapabilityProbe for WindowsSandboxProbe {
    fn kind(&self) -> BackendKind {
        BackendKind::WindowsSandbox
    }

    async fn is_installed(&self) -> ProbeStatus {
        ProbeStatus::from_result(lookup_executable(LAUNCHER))
    }

    async fn is_enabled(&self) -> ProbeStatus {
        ProbeStatus::from_result(Self::feature_enabled().await)
    }

    async fn activate(&self) -> SandboxResult<bool> {
        Self::feature_command("Enable-WindowsOptionalFeature", &["-NoRestart"]).await?;
        Ok(true)
    }

    async fn deactivate(&self) -> SandboxResult<bool> {
        Self::feature_command("Disable-WindowsOptionalFeature", &["-NoRestart"]).await?;
        Ok(true)
    }
}

type VmExit = Result<Option<i32>, String>;

/// Supervised VM process
#[derive(Debug)]
struct VmHandle {
    kill: Option<oneshot::Sender<()>>,
    exit: watch::Receiver<Option<VmExit>>,
}

#[derive(Debug, Default)]
enum VmState {
    #[default]
    Idle,
    Running(VmHandle),
    Exited(VmExit),
}

fn spawn_vm(descriptor: &Path) -> SandboxResult<VmHandle> {
    let mut child = Command::new(LAUNCHER)
        .arg(descriptor)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SandboxError::LaunchFailure(format!("{}: {}", LAUNCHER, e)))?;

    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    let (exit_tx, exit_rx) = watch::channel(None);

    tokio::spawn(async move {
        // A dropped sender counts as a kill request
        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = kill_rx => None,
        };
        let status = match exited {
            Some(status) => status,
            None => match child.kill().await {
                Ok(()) => child.wait().await,
                Err(e) => Err(e),
            },
        };
        let exit = status.map(|s| s.code()).map_err(|e| e.to_string());
        debug!(exit = ?exit, "windows sandbox process finished");
        let _ = exit_tx.send(Some(exit));
    });

    Ok(VmHandle {
        kill: Some(kill_tx),
        exit: exit_rx,
    })
}

async fn wait_exit(mut exit: watch::Receiver<Option<VmExit>>) -> VmExit {
    let outcome = match exit.wait_for(Option::is_some).await {
        Ok(value) => value.clone().unwrap_or(Ok(None)),
        Err(_) => Err("supervisor stopped without reporting an exit".to_string()),
    };
    outcome
}

/// Windows Sandbox instance
#[derive(Debug)]
pub struct WindowsSandbox {
    config: WindowsSandboxConfig,
    descriptor_path: PathBuf,
    shared_folder: PathBuf,
    instance: InstanceSlot,
    lifecycle: Lifecycle,
    vm: Mutex<VmState>,
}

impl WindowsSandbox {
    pub async fn new(config: WindowsSandboxConfig) -> SandboxResult<Self> {
        WindowsSandboxProbe.ensure_available().await?;
        let host_ips = host_addresses()?;
        Self::from_config(config, &host_ips)
    }

    pub(crate) fn from_config(config: WindowsSandboxConfig, host_ips: &[String]) -> SandboxResult<Self> {
        let instance = InstanceDir::create(BackendKind::WindowsSandbox.as_str(), config.temp_dir.as_deref())?;
        let shared_folder = instance.path().join(SHARED_FOLDER_NAME);
        std::fs::create_dir_all(&shared_folder)
            .map_err(|e| SandboxError::StageFailure(format!("create shared folder: {}", e)))?;

        let descriptor = compile_descriptor(&config, &shared_folder, host_ips)?;
        trace_compiled(BackendKind::WindowsSandbox.as_str(), &descriptor);
        let descriptor_path = instance.write_file(DESCRIPTOR_FILE_NAME, descriptor.as_bytes(), 0o600)?;
        trace_instance_created(BackendKind::WindowsSandbox.as_str());

        Ok(Self {
            config,
            descriptor_path,
            shared_folder,
            instance: InstanceSlot::new(instance),
            lifecycle: Lifecycle::new(BackendKind::WindowsSandbox, InstanceState::Configured),
            vm: Mutex::new(VmState::Idle),
        })
    }

    pub fn config(&self) -> &WindowsSandboxConfig {
        &self.config
    }

    pub fn descriptor_path(&self) -> &Path {
        &self.descriptor_path
    }

    /// Host side of the folder shared with every guest
    pub fn shared_folder(&self) -> &Path {
        &self.shared_folder
    }

    /// Where the shared folder appears inside the guest
    pub fn guest_shared_folder(&self) -> String {
        format!(r"{}\{}", WINDOWS_DEFAULT_MOUNT_POINT, SHARED_FOLDER_NAME)
    }

    async fn stop_vm(&self) -> SandboxResult<()> {
        let mut vm = self.vm.lock().await;
        if let VmState::Running(handle) = &mut *vm {
            if let Some(kill) = handle.kill.take() {
                let _ = kill.send(());
            }
            let exit = wait_exit(handle.exit.clone()).await;
            info!(exit = ?exit, "windows sandbox stopped");
            *vm = VmState::Exited(exit);
        }
        Ok(())
    }
}

fn agent_required() -> SandboxError {
    SandboxError::NotImplemented("requires an agent installed in the sandbox".to_string())
}

#[async_trait]
impl Sandbox for WindowsSandbox {
    fn kind(&self) -> BackendKind {
        BackendKind::WindowsSandbox
    }

    fn state(&self) -> InstanceState {
        self.lifecycle.state()
    }

    async fn run_with_options(
        &self,
        _ctx: &ExecContext,
        _options: CommandOptions,
    ) -> SandboxResult<ExecutionResult> {
        self.lifecycle.ensure_active()?;
        Err(agent_required())
    }

    async fn run_source(&self, _ctx: &ExecContext, _source: &str) -> SandboxResult<ExecutionResult> {
        self.lifecycle.ensure_active()?;
        Err(agent_required())
    }

    async fn start(&self) -> SandboxResult<()> {
        let mut vm = self.vm.lock().await;
        self.lifecycle.ensure_active()?;
        if matches!(*vm, VmState::Running(_)) {
            return Err(SandboxError::InvalidState(
                "windows sandbox is already running".to_string(),
            ));
        }
        let handle = spawn_vm(&self.descriptor_path)?;
        self.lifecycle.enter_run()?;
        info!(descriptor = %self.descriptor_path.display(), "windows sandbox started");
        *vm = VmState::Running(handle);
        Ok(())
    }

    async fn wait(&self) -> SandboxResult<()> {
        self.lifecycle.ensure_active()?;
        // The lock is released while waiting so `stop` stays reachable
        let exit = {
            let vm = self.vm.lock().await;
            match &*vm {
                VmState::Running(handle) => handle.exit.clone(),
                VmState::Exited(exit) => return vm_exit_result(exit.clone()),
                VmState::Idle => {
                    return Err(SandboxError::InvalidState(
                        "windows sandbox was not started".to_string(),
                    ))
                }
            }
        };

        let outcome = wait_exit(exit).await;
        let mut vm = self.vm.lock().await;
        if matches!(*vm, VmState::Running(_)) {
            *vm = VmState::Exited(outcome.clone());
        }
        vm_exit_result(outcome)
    }

    async fn stop(&self) -> SandboxResult<()> {
        self.lifecycle.ensure_active()?;
        self.stop_vm().await
    }

    async fn clear(&self) -> SandboxResult<()> {
        if self.lifecycle.mark_cleared() {
            info!(backend = BackendKind::WindowsSandbox.as_str(), "clearing sandbox instance");
        }
        if let Err(e) = self.stop_vm().await {
            warn!(error = %e, "failed to stop windows sandbox during clear");
        }
        self.instance.close()
    }
}

fn vm_exit_result(exit: VmExit) -> SandboxResult<()> {
    match exit {
        Ok(Some(0)) => Ok(()),
        Ok(code) => Err(SandboxError::RuntimeFailure {
            command: LAUNCHER.to_string(),
            code,
        }),
        Err(e) => Err(SandboxError::LaunchFailure(e)),
    }
}

/*!
 * Docker Backend
 * One throwaway container per command, driven through the Engine API
 */

use super::{record_outcome, staged_script_options};
use crate::core::errors::{SandboxError, SandboxResult};
use crate::core::limits::{CONTAINER_SCRIPT_INTERPRETER, DEFAULT_CONTAINER_TIMEOUT, PROBE_TIMEOUT};
use crate::core::serde::{duration_millis, is_empty_vec, is_false, is_none};
use crate::monitoring::{trace_compiled, trace_instance_created, RunSpan};
use crate::sandbox::context::ExecContext;
use crate::sandbox::probe::lookup_executable;
use crate::sandbox::staging::{InstanceDir, InstanceSlot};
use crate::sandbox::traits::{CapabilityProbe, Sandbox};
use crate::sandbox::types::{
    merge_environment, validate_env_key, BackendKind, BindMount, CommandOptions, ExecutionResult,
    InstanceState, Lifecycle, ProbeStatus,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::pin::pin;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

fn default_timeout() -> Duration {
    DEFAULT_CONTAINER_TIMEOUT
}

fn is_default_timeout(timeout: &Duration) -> bool {
    *timeout == DEFAULT_CONTAINER_TIMEOUT
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerConfig {
    /// e.g. `alpine:latest`; pulled on first use
    pub image: String,
    #[serde(default, skip_serializing_if = "is_none")]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// `bridge`, `host`, a network name...
    #[serde(default, skip_serializing_if = "is_none")]
    pub network_mode: Option<String>,
    /// Forces network mode `none`
    #[serde(default, skip_serializing_if = "is_false")]
    pub network_disabled: bool,
    #[serde(default, skip_serializing_if = "is_none")]
    pub user: Option<String>,
    /// Bytes, or a `k`/`m`/`g` suffixed size (base 1024)
    #[serde(default, skip_serializing_if = "is_none")]
    pub memory: Option<String>,
    /// Decimal number of CPUs, e.g. `0.5`
    #[serde(default, skip_serializing_if = "is_none")]
    pub cpu_limit: Option<String>,
    /// Static binds; per-call binds win on the same container path
    #[serde(default, skip_serializing_if = "is_empty_vec")]
    pub binds: Vec<BindMount>,
    /// Whole-run deadline in milliseconds
    #[serde(
        default = "default_timeout",
        with = "duration_millis",
        skip_serializing_if = "is_default_timeout"
    )]
    pub timeout: Duration,
    #[serde(default, skip_serializing_if = "is_none")]
    pub temp_dir: Option<PathBuf>,
}

impl DockerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            working_dir: None,
            environment: BTreeMap::new(),
            network_mode: None,
            network_disabled: false,
            user: None,
            memory: None,
            cpu_limit: None,
            binds: Vec::new(),
            timeout: DEFAULT_CONTAINER_TIMEOUT,
            temp_dir: None,
        }
    }

    fn validate(&self) -> SandboxResult<()> {
        if self.image.trim().is_empty() {
            return Err(SandboxError::ConfigInvalid(
                "docker image must be specified".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(SandboxError::ConfigInvalid(
                "docker timeout must be positive".to_string(),
            ));
        }
        for key in self.environment.keys() {
            validate_env_key(key)?;
        }
        if let Some(memory) = &self.memory {
            parse_memory_limit(memory)?;
        }
        if let Some(cpus) = &self.cpu_limit {
            parse_cpu_limit(cpus)?;
        }
        Ok(())
    }
}

/// `512m`, `1g`, `64k` or plain bytes
pub fn parse_memory_limit(memory: &str) -> SandboxResult<i64> {
    let value = memory.trim().to_ascii_lowercase();
    let (digits, multiplier) = match value.char_indices().last() {
        Some((idx, 'k')) => (&value[..idx], 1024_i64),
        Some((idx, 'm')) => (&value[..idx], 1024 * 1024),
        Some((idx, 'g')) => (&value[..idx], 1024 * 1024 * 1024),
        _ => (value.as_str(), 1),
    };
    let invalid = || SandboxError::ConfigInvalid(format!("invalid memory limit {:?}", memory));
    let amount: i64 = digits.trim().parse().map_err(|_| invalid())?;
    if amount <= 0 {
        return Err(invalid());
    }
    amount.checked_mul(multiplier).ok_or_else(invalid)
}

/// Decimal CPU count to Engine API nano-CPUs
pub fn parse_cpu_limit(cpus: &str) -> SandboxResult<i64> {
    let invalid = || SandboxError::ConfigInvalid(format!("invalid cpu limit {:?}", cpus));
    let value: f64 = cpus.trim().parse().map_err(|_| invalid())?;
    if !value.is_finite() || value <= 0.0 || value > 1e6 {
        return Err(invalid());
    }
    Ok((value * 1e9).round() as i64)
}

/// Docker bind spec `host:container[:ro]`, deduplicated by container path
fn compile_binds(static_binds: &[BindMount], per_call: &[BindMount]) -> Vec<String> {
    let mut by_target: BTreeMap<PathBuf, String> = BTreeMap::new();
    for bind in static_binds.iter().chain(per_call) {
        let Some(host) = bind.resolved_host_path() else {
            debug!(host = %bind.host_path.display(), "skipping unresolvable bind");
            continue;
        };
        let mut spec = format!("{}:{}", host.display(), bind.sandbox_path.display());
        if bind.read_only {
            spec.push_str(":ro");
        }
        by_target.insert(bind.sandbox_path.clone(), spec);
    }
    by_target.into_values().collect()
}

/// Container and host spec for one command
pub fn compile_container(
    config: &DockerConfig,
    options: &CommandOptions,
) -> SandboxResult<Config<String>> {
    options.validate()?;
    if options.stdin.is_some() {
        return Err(SandboxError::ConfigInvalid(
            "stdin is not supported by the docker backend".to_string(),
        ));
    }

    let env: Vec<String> = merge_environment(&config.environment, &options.environment)
        .into_iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();

    let network_mode = if config.network_disabled {
        Some("none".to_string())
    } else {
        config.network_mode.clone()
    };

    let binds = compile_binds(&config.binds, &options.binds);
    let host_config = HostConfig {
        network_mode,
        memory: config.memory.as_deref().map(parse_memory_limit).transpose()?,
        nano_cpus: config.cpu_limit.as_deref().map(parse_cpu_limit).transpose()?,
        binds: (!binds.is_empty()).then_some(binds),
        auto_remove: Some(false),
        ..Default::default()
    };

    let working_dir = options
        .effective_dir()
        .map(|dir| dir.display().to_string())
        .or_else(|| config.working_dir.clone());

    Ok(Config {
        image: Some(config.image.clone()),
        cmd: Some(options.argv()),
        working_dir,
        env: Some(env),
        user: config.user.clone(),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config: Some(host_config),
        ..Default::default()
    })
}

fn engine(context: &str, err: bollard::errors::Error) -> SandboxError {
    SandboxError::Engine(format!("{}: {}", context, err))
}

async fn ping(docker: &Docker) -> SandboxResult<()> {
    match tokio::time::timeout(PROBE_TIMEOUT, docker.ping()).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(SandboxError::NotEnabled(format!("docker daemon: {}", e))),
        Err(_) => Err(SandboxError::NotEnabled(
            "docker daemon did not answer in time".to_string(),
        )),
    }
}

fn connect() -> SandboxResult<Docker> {
    Docker::connect_with_local_defaults()
        .map_err(|e| SandboxError::NotEnabled(format!("docker client: {}", e)))
}

/// The daemon cannot be started or stopped from here
#[derive(Debug, Clone, Copy, Default)]
pub struct DockerProbe;

#[async_trait]
impl CapabilityProbe for DockerProbe {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn is_installed(&self) -> ProbeStatus {
        ProbeStatus::from_result(lookup_executable("docker"))
    }

    async fn is_enabled(&self) -> ProbeStatus {
        let reachable = match connect() {
            Ok(docker) => ping(&docker).await,
            Err(e) => Err(e),
        };
        ProbeStatus::from_result(reachable)
    }

    async fn activate(&self) -> SandboxResult<bool> {
        if self.is_enabled().await.available {
            Ok(true)
        } else {
            Err(SandboxError::NotToggleable(
                "docker daemon must be started by the host".to_string(),
            ))
        }
    }
}

/// Docker instance
pub struct DockerContainer {
    config: DockerConfig,
    docker: Docker,
    instance: InstanceSlot,
    lifecycle: Lifecycle,
}

impl std::fmt::Debug for DockerContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerContainer")
            .field("config", &self.config)
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

impl DockerContainer {
    pub async fn new(config: DockerConfig) -> SandboxResult<Self> {
        config.validate()?;
        DockerProbe.is_installed().await.into_result()?;
        let docker = connect()?;
        ping(&docker).await?;

        let instance = InstanceDir::create(BackendKind::Docker.as_str(), config.temp_dir.as_deref())?;
        trace_instance_created(BackendKind::Docker.as_str());

        Ok(Self {
            config,
            docker,
            instance: InstanceSlot::new(instance),
            lifecycle: Lifecycle::new(BackendKind::Docker, InstanceState::Configured),
        })
    }

    pub fn config(&self) -> &DockerConfig {
        &self.config
    }

    /// Pull the image unless it is present; the pull stream is drained
    async fn ensure_image(&self) -> SandboxResult<()> {
        if self.docker.inspect_image(&self.config.image).await.is_ok() {
            return Ok(());
        }

        info!(image = %self.config.image, "pulling image");
        let options = CreateImageOptions {
            from_image: self.config.image.as_str(),
            ..Default::default()
        };
        let mut pull = pin!(self.docker.create_image(Some(options), None, None));
        while let Some(progress) = pull.next().await {
            let progress = progress.map_err(|e| engine("pull image", e))?;
            if let Some(status) = progress.status {
                debug!(image = %self.config.image, status = %status, "pull progress");
            }
        }
        Ok(())
    }

    /// Start, wait for `not-running`, collect demultiplexed logs
    async fn start_and_collect(&self, id: &str, command: String) -> SandboxResult<ExecutionResult> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| engine("start container", e))?;

        let mut status_code = None;
        let mut wait = pin!(self.docker.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        ));
        while let Some(item) = wait.next().await {
            match item {
                Ok(response) => status_code = Some(response.status_code),
                // Non-zero exits surface as a wait error carrying the code
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    status_code = Some(code);
                }
                Err(e) => return Err(engine("wait container", e)),
            }
        }

        let mut result = ExecutionResult::new(command);
        let mut logs = pin!(self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        ));
        while let Some(chunk) = logs.next().await {
            match chunk.map_err(|e| engine("container logs", e))? {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    result.stdout.extend_from_slice(&message);
                }
                LogOutput::StdErr { message } => result.stderr.extend_from_slice(&message),
                LogOutput::StdIn { .. } => {}
            }
        }

        let code = status_code.map(|code| i32::try_from(code).unwrap_or(i32::MAX));
        result.set_exit(code, None);
        Ok(result)
    }

    async fn remove(&self, id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(id, Some(options)).await {
            let err = SandboxError::CleanupFailure(format!("container {}: {}", id, e));
            warn!(error = %err, "failed to remove container");
        }
    }

    async fn run_container(
        &self,
        ctx: &ExecContext,
        options: &CommandOptions,
    ) -> SandboxResult<ExecutionResult> {
        let container = compile_container(&self.config, options)?;
        let command = format!("{} {}", self.config.image, options.argv().join(" "));
        trace_compiled(BackendKind::Docker.as_str(), &command);
        let ctx = ctx.clone().timeout(self.config.timeout);

        ctx.run_until_done(self.ensure_image())
            .await
            .map_err(|interrupt| interrupt.into_error(&command))??;

        // Not raced: an abandoned create could leak a container we cannot name
        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, container)
            .await
            .map_err(|e| engine("create container", e))?;
        debug!(id = %created.id, "container created");

        let outcome = ctx
            .run_until_done(self.start_and_collect(&created.id, command.clone()))
            .await;
        self.remove(&created.id).await;

        match outcome {
            Ok(result) => result,
            Err(interrupt) => Err(interrupt.into_error(&command)),
        }
    }

    async fn traced(
        &self,
        ctx: &ExecContext,
        options: &CommandOptions,
        operation: &'static str,
    ) -> SandboxResult<ExecutionResult> {
        let run = RunSpan::new(BackendKind::Docker.as_str(), operation);
        let outcome = self.run_container(ctx, options).instrument(run.span()).await;
        record_outcome(&run, &outcome);
        outcome
    }
}

#[async_trait]
impl Sandbox for DockerContainer {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    fn state(&self) -> InstanceState {
        self.lifecycle.state()
    }

    async fn run_with_options(
        &self,
        ctx: &ExecContext,
        options: CommandOptions,
    ) -> SandboxResult<ExecutionResult> {
        self.lifecycle.enter_run()?;
        self.traced(ctx, &options, "run").await
    }

    async fn run_source(&self, ctx: &ExecContext, source: &str) -> SandboxResult<ExecutionResult> {
        self.lifecycle.enter_run()?;
        let staged = self.instance.stage(source)?;
        let options = staged_script_options(staged.dir(), CONTAINER_SCRIPT_INTERPRETER, true);
        let outcome = self.traced(ctx, &options, "run_source").await;
        staged.cleanup();
        outcome
    }

    async fn clear(&self) -> SandboxResult<()> {
        if self.lifecycle.mark_cleared() {
            info!(backend = BackendKind::Docker.as_str(), "clearing sandbox instance");
        }
        self.instance.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_memory_limit(" 4096 ").unwrap(), 4096);
        for bad in ["", "m", "12x", "-1m", "0", "1.5g", "99999999999999g"] {
            assert!(parse_memory_limit(bad).unwrap_err().is_config_invalid(), "{}", bad);
        }
    }

    #[test]
    fn test_parse_cpu_limit() {
        assert_eq!(parse_cpu_limit("0.5").unwrap(), 500_000_000);
        assert_eq!(parse_cpu_limit("2").unwrap(), 2_000_000_000);
        for bad in ["", "abc", "0", "-1", "NaN", "inf"] {
            assert!(parse_cpu_limit(bad).unwrap_err().is_config_invalid(), "{}", bad);
        }
    }

    #[test]
    fn test_invalid_limits_rejected_at_construction() {
        let mut config = DockerConfig::new("alpine:latest");
        config.memory = Some("lots".into());
        assert!(config.validate().unwrap_err().is_config_invalid());

        let mut config = DockerConfig::new("alpine:latest");
        config.cpu_limit = Some("-2".into());
        assert!(config.validate().unwrap_err().is_config_invalid());

        assert!(DockerConfig::new(" ").validate().unwrap_err().is_config_invalid());
    }

    #[test]
    fn test_compile_container() {
        let mut config = DockerConfig::new("alpine:latest");
        config.working_dir = Some("/work".into());
        config.network_disabled = true;
        config.network_mode = Some("bridge".into());
        config.memory = Some("256m".into());
        config.cpu_limit = Some("1.5".into());
        config.user = Some("nobody".into());
        config.environment.insert("B".into(), "2".into());
        config.environment.insert("A".into(), "static".into());

        let options = CommandOptions::new("echo")
            .with_args(vec!["hello".into()])
            .with_env("A", "1");
        let container = compile_container(&config, &options).unwrap();

        assert_eq!(container.image.as_deref(), Some("alpine:latest"));
        assert_eq!(
            container.cmd,
            Some(vec!["echo".to_string(), "hello".to_string()])
        );
        assert_eq!(container.working_dir.as_deref(), Some("/work"));
        assert_eq!(
            container.env,
            Some(vec!["A=1".to_string(), "B=2".to_string()])
        );
        assert_eq!(container.user.as_deref(), Some("nobody"));

        let host = container.host_config.unwrap();
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(1_500_000_000));
        assert_eq!(host.binds, None);
    }

    #[test]
    fn test_binds_deduplicated_per_call_wins() {
        let static_src = tempfile::tempdir().unwrap();
        let call_src = tempfile::tempdir().unwrap();
        let mut config = DockerConfig::new("alpine:latest");
        config.binds = vec![BindMount::new(static_src.path(), "/data")];

        let options = CommandOptions::new("ls")
            .with_bind(BindMount::read_only(call_src.path(), "/data"))
            .with_chdir("/data");
        let container = compile_container(&config, &options).unwrap();

        let call_host = call_src.path().canonicalize().unwrap();
        assert_eq!(
            container.host_config.unwrap().binds,
            Some(vec![format!("{}:/data:ro", call_host.display())])
        );
        assert_eq!(container.working_dir.as_deref(), Some("/data"));
    }

    #[test]
    fn test_stdin_rejected() {
        let config = DockerConfig::new("alpine:latest");
        let options = CommandOptions::new("cat").with_stdin("x");
        assert!(compile_container(&config, &options)
            .unwrap_err()
            .is_config_invalid());
    }

    #[test]
    fn test_config_json_defaults() {
        let config: DockerConfig = serde_json::from_str(r#"{"image":"alpine"}"#).unwrap();
        assert_eq!(config.timeout, DEFAULT_CONTAINER_TIMEOUT);
        let config: DockerConfig =
            serde_json::from_str(r#"{"image":"alpine","timeout":1500}"#).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(1500));
    }
}

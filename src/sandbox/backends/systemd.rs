/*!
 * Linux systemd-run Backend
 * Runs each command as a transient user unit with sandboxing properties
 */

use super::{run_traced, staged_script_options};
use crate::core::errors::{SandboxError, SandboxResult};
use crate::core::limits::{DEFAULT_SCRIPT_INTERPRETER, SYSTEMD_RUN_PROLOGUE};
use crate::monitoring::{trace_compiled, trace_instance_created};
use crate::sandbox::context::ExecContext;
use crate::sandbox::exec::ProcessSpec;
use crate::sandbox::probe::{lookup_executable, require_probe_success};
use crate::sandbox::staging::{InstanceDir, InstanceSlot};
use crate::sandbox::traits::{CapabilityProbe, Sandbox};
use crate::sandbox::types::{
    BackendKind, CommandOptions, ExecutionResult, InstanceState, Lifecycle, ProbeStatus,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info};

const LAUNCHER: &str = "systemd-run";

/// Unit property name
///
/// Well-known sandboxing properties have variants; anything else passes
/// through verbatim as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Filter {
    PrivateTmp,
    PrivateNetwork,
    SELinuxContext,
    NoNewPrivileges,
    ProtectSystem,
    ProtectHome,
    ProtectDevices,
    CapabilityBoundingSet,
    ReadWriteDirectories,
    ReadOnlyDirectories,
    InaccessibleDirectories,
    ProtectKernelTunables,
    ProtectKernelModules,
    ProtectControlGroups,
    RestrictNamespaces,
    MemoryDenyWriteExecute,
    RestrictRealtime,
    PrivateMounts,
    DynamicUser,
    SystemCallFilter,
    Other(String),
}

impl Filter {
    pub fn as_str(&self) -> &str {
        match self {
            Filter::PrivateTmp => "PrivateTmp",
            Filter::PrivateNetwork => "PrivateNetwork",
            Filter::SELinuxContext => "SELinuxContext",
            Filter::NoNewPrivileges => "NoNewPrivileges",
            Filter::ProtectSystem => "ProtectSystem",
            Filter::ProtectHome => "ProtectHome",
            Filter::ProtectDevices => "ProtectDevices",
            Filter::CapabilityBoundingSet => "CapabilityBoundingSet",
            Filter::ReadWriteDirectories => "ReadWriteDirectories",
            Filter::ReadOnlyDirectories => "ReadOnlyDirectories",
            Filter::InaccessibleDirectories => "InaccessibleDirectories",
            Filter::ProtectKernelTunables => "ProtectKernelTunables",
            Filter::ProtectKernelModules => "ProtectKernelModules",
            Filter::ProtectControlGroups => "ProtectControlGroups",
            Filter::RestrictNamespaces => "RestrictNamespaces",
            Filter::MemoryDenyWriteExecute => "MemoryDenyWriteExecute",
            Filter::RestrictRealtime => "RestrictRealtime",
            Filter::PrivateMounts => "PrivateMounts",
            Filter::DynamicUser => "DynamicUser",
            Filter::SystemCallFilter => "SystemCallFilter",
            Filter::Other(name) => name,
        }
    }

    fn validate(&self) -> SandboxResult<()> {
        let name = self.as_str();
        if name.trim().is_empty() {
            return Err(SandboxError::ConfigInvalid("empty filter".to_string()));
        }
        if name.contains('=') || name.chars().any(char::is_whitespace) {
            return Err(SandboxError::ConfigInvalid(format!(
                "invalid filter name {:?}",
                name
            )));
        }
        Ok(())
    }
}

impl From<String> for Filter {
    fn from(name: String) -> Self {
        match name.as_str() {
            "PrivateTmp" => Filter::PrivateTmp,
            "PrivateNetwork" => Filter::PrivateNetwork,
            "SELinuxContext" => Filter::SELinuxContext,
            "NoNewPrivileges" => Filter::NoNewPrivileges,
            "ProtectSystem" => Filter::ProtectSystem,
            "ProtectHome" => Filter::ProtectHome,
            "ProtectDevices" => Filter::ProtectDevices,
            "CapabilityBoundingSet" => Filter::CapabilityBoundingSet,
            "ReadWriteDirectories" => Filter::ReadWriteDirectories,
            "ReadOnlyDirectories" => Filter::ReadOnlyDirectories,
            "InaccessibleDirectories" => Filter::InaccessibleDirectories,
            "ProtectKernelTunables" => Filter::ProtectKernelTunables,
            "ProtectKernelModules" => Filter::ProtectKernelModules,
            "ProtectControlGroups" => Filter::ProtectControlGroups,
            "RestrictNamespaces" => Filter::RestrictNamespaces,
            "MemoryDenyWriteExecute" => Filter::MemoryDenyWriteExecute,
            "RestrictRealtime" => Filter::RestrictRealtime,
            "PrivateMounts" => Filter::PrivateMounts,
            "DynamicUser" => Filter::DynamicUser,
            "SystemCallFilter" => Filter::SystemCallFilter,
            _ => Filter::Other(name),
        }
    }
}

impl From<Filter> for String {
    fn from(filter: Filter) -> Self {
        filter.as_str().to_string()
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Property value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PolicyArg {
    /// `yes` or `no`, case-insensitive
    Bool(String),
    Folders(Vec<PathBuf>),
    Capabilities(Vec<String>),
    Namespaces(Vec<String>),
    SystemCalls(Vec<String>),
    /// Free-form single-line value
    Text(String),
}

impl PolicyArg {
    fn render(&self, filter: &Filter) -> SandboxResult<String> {
        match self {
            PolicyArg::Bool(value) => {
                if value.eq_ignore_ascii_case("yes") || value.eq_ignore_ascii_case("no") {
                    Ok(value.to_ascii_lowercase())
                } else {
                    Err(SandboxError::ConfigInvalid(format!(
                        "{}: invalid value {:?} (yes/no)",
                        filter, value
                    )))
                }
            }
            PolicyArg::Folders(paths) => {
                let entries = paths
                    .iter()
                    .map(|path| {
                        path.to_str().map(str::to_string).ok_or_else(|| {
                            SandboxError::ConfigInvalid(format!(
                                "{}: path {:?} is not valid UTF-8",
                                filter, path
                            ))
                        })
                    })
                    .collect::<SandboxResult<Vec<_>>>()?;
                join_list(filter, &entries)
            }
            PolicyArg::Capabilities(items)
            | PolicyArg::Namespaces(items)
            | PolicyArg::SystemCalls(items) => join_list(filter, items),
            PolicyArg::Text(value) => {
                if value.trim().is_empty() || value.contains('\n') {
                    return Err(SandboxError::ConfigInvalid(format!(
                        "{}: text value must be a non-empty single line",
                        filter
                    )));
                }
                Ok(value.clone())
            }
        }
    }
}

fn join_list(filter: &Filter, items: &[String]) -> SandboxResult<String> {
    if items.is_empty() {
        return Err(SandboxError::ConfigInvalid(format!(
            "{}: list value cannot be empty",
            filter
        )));
    }
    if items.iter().any(|item| item.trim().is_empty() || item.contains(',')) {
        return Err(SandboxError::ConfigInvalid(format!(
            "{}: list entries must be non-empty and comma-free",
            filter
        )));
    }
    Ok(items.join(","))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyRule {
    pub filter: Filter,
    pub arg: PolicyArg,
}

impl PropertyRule {
    pub fn new(filter: Filter, arg: PolicyArg) -> Self {
        Self { filter, arg }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemdRunConfig {
    pub rules: Vec<PropertyRule>,
    /// Parent of the instance staging directory
    pub temp_dir: Option<PathBuf>,
}

/// `--pipe --pty --user` followed by `-p Name=value` per rule
///
/// A filter given more than once keeps only its last occurrence.
pub fn compile_properties(rules: &[PropertyRule]) -> SandboxResult<Vec<String>> {
    let mut rendered = Vec::with_capacity(rules.len());
    for rule in rules {
        rule.filter.validate()?;
        let value = rule.arg.render(&rule.filter)?;
        rendered.push((rule.filter.as_str(), value));
    }

    let mut args: Vec<String> = SYSTEMD_RUN_PROLOGUE.iter().map(|s| s.to_string()).collect();
    for (index, (name, value)) in rendered.iter().enumerate() {
        if rendered[index + 1..].iter().any(|(later, _)| later == name) {
            debug!(filter = %name, "dropping property overridden by a later rule");
            continue;
        }
        args.push("-p".to_string());
        args.push(format!("{}={}", name, value));
    }
    Ok(args)
}

/// Needs both the launcher and a reachable user manager
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemdRunProbe;

#[async_trait]
impl CapabilityProbe for SystemdRunProbe {
    fn kind(&self) -> BackendKind {
        BackendKind::SystemdRun
    }

    async fn is_installed(&self) -> ProbeStatus {
        ProbeStatus::from_result(lookup_executable(LAUNCHER))
    }

    async fn is_enabled(&self) -> ProbeStatus {
        let installed = self.is_installed().await;
        if !installed.available {
            return installed;
        }
        ProbeStatus::from_result(
            require_probe_success("systemctl", &["--user", "show-environment"], "user manager")
                .await,
        )
    }
}

/// systemd-run instance; properties are compiled once at construction
#[derive(Debug)]
pub struct LinuxSystemdRun {
    config: SystemdRunConfig,
    properties: Vec<String>,
    instance: InstanceSlot,
    lifecycle: Lifecycle,
}

impl LinuxSystemdRun {
    pub async fn new(config: SystemdRunConfig) -> SandboxResult<Self> {
        SystemdRunProbe.ensure_available().await?;
        Self::from_config(config)
    }

    pub(crate) fn from_config(config: SystemdRunConfig) -> SandboxResult<Self> {
        let properties = compile_properties(&config.rules)?;
        trace_compiled(BackendKind::SystemdRun.as_str(), &properties.join(" "));

        let instance = InstanceDir::create(BackendKind::SystemdRun.as_str(), config.temp_dir.as_deref())?;
        trace_instance_created(BackendKind::SystemdRun.as_str());

        Ok(Self {
            config,
            properties,
            instance: InstanceSlot::new(instance),
            lifecycle: Lifecycle::new(BackendKind::SystemdRun, InstanceState::Configured),
        })
    }

    pub fn config(&self) -> &SystemdRunConfig {
        &self.config
    }

    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    /// Static properties, then per-call environment, directory and binds, then the command
    pub fn compile_invocation(&self, options: &CommandOptions) -> SandboxResult<ProcessSpec> {
        options.validate()?;
        let mut args = self.properties.clone();

        for (key, value) in &options.environment {
            args.push(format!("--setenv={}={}", key, value));
        }
        if let Some(dir) = options.effective_dir() {
            args.push(format!("--working-directory={}", dir.display()));
        }
        for bind in &options.binds {
            let Some(host) = bind.resolved_host_path() else {
                debug!(host = %bind.host_path.display(), "skipping unresolvable bind");
                continue;
            };
            let property = if bind.read_only {
                "BindReadOnlyPaths"
            } else {
                "BindPaths"
            };
            args.push("-p".to_string());
            args.push(format!(
                "{}={}:{}",
                property,
                host.display(),
                bind.sandbox_path.display()
            ));
        }
        args.extend(options.argv());

        Ok(ProcessSpec::new(LAUNCHER)
            .with_args(args)
            .with_stdin(options.stdin.clone()))
    }
}

#[async_trait]
impl Sandbox for LinuxSystemdRun {
    fn kind(&self) -> BackendKind {
        BackendKind::SystemdRun
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
        run_traced(BackendKind::SystemdRun, "run", &spec, ctx).await
    }

    async fn run_source(&self, ctx: &ExecContext, source: &str) -> SandboxResult<ExecutionResult> {
        self.lifecycle.enter_run()?;
        let staged = self.instance.stage(source)?;
        let options = staged_script_options(staged.dir(), DEFAULT_SCRIPT_INTERPRETER, true);
        let outcome = match self.compile_invocation(&options) {
            Ok(spec) => run_traced(BackendKind::SystemdRun, "run_source", &spec, ctx).await,
            Err(e) => Err(e),
        };
        staged.cleanup();
        outcome
    }

    async fn clear(&self) -> SandboxResult<()> {
        if self.lifecycle.mark_cleared() {
            info!(backend = BackendKind::SystemdRun.as_str(), "clearing sandbox instance");
        }
        self.instance.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::types::BindMount;
    use pretty_assertions::assert_eq;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_compile_properties() {
        let rules = vec![
            PropertyRule::new(Filter::PrivateNetwork, PolicyArg::Bool("YES".into())),
            PropertyRule::new(
                Filter::InaccessibleDirectories,
                PolicyArg::Folders(vec![PathBuf::from("/home"), PathBuf::from("/root")]),
            ),
            PropertyRule::new(
                Filter::SystemCallFilter,
                PolicyArg::SystemCalls(strings(&["@system-service", "~@mount"])),
            ),
            PropertyRule::new(Filter::ProtectSystem, PolicyArg::Text("strict".into())),
        ];
        assert_eq!(
            compile_properties(&rules).unwrap(),
            strings(&[
                "--pipe",
                "--pty",
                "--user",
                "-p",
                "PrivateNetwork=yes",
                "-p",
                "InaccessibleDirectories=/home,/root",
                "-p",
                "SystemCallFilter=@system-service,~@mount",
                "-p",
                "ProtectSystem=strict",
            ])
        );
    }

    #[test]
    fn test_protect_kernel_tunables_has_its_own_name() {
        let rules = vec![PropertyRule::new(
            Filter::ProtectKernelTunables,
            PolicyArg::Bool("no".into()),
        )];
        let args = compile_properties(&rules).unwrap();
        assert_eq!(args.last().unwrap(), "ProtectKernelTunables=no");
    }

    #[test]
    fn test_invalid_bool_rejected() {
        let rules = vec![PropertyRule::new(
            Filter::PrivateTmp,
            PolicyArg::Bool("maybe".into()),
        )];
        assert!(compile_properties(&rules).unwrap_err().is_config_invalid());
    }

    #[test]
    fn test_empty_filter_and_list_rejected() {
        let rules = vec![PropertyRule::new(
            Filter::Other(String::new()),
            PolicyArg::Bool("yes".into()),
        )];
        assert!(compile_properties(&rules).unwrap_err().is_config_invalid());

        let rules = vec![PropertyRule::new(
            Filter::CapabilityBoundingSet,
            PolicyArg::Capabilities(vec![]),
        )];
        assert!(compile_properties(&rules).unwrap_err().is_config_invalid());

        let rules = vec![PropertyRule::new(
            Filter::RestrictNamespaces,
            PolicyArg::Namespaces(strings(&["net", ""])),
        )];
        assert!(compile_properties(&rules).unwrap_err().is_config_invalid());
    }

    #[test]
    fn test_duplicate_filter_last_wins() {
        let rules = vec![
            PropertyRule::new(Filter::PrivateTmp, PolicyArg::Bool("yes".into())),
            PropertyRule::new(Filter::NoNewPrivileges, PolicyArg::Bool("yes".into())),
            PropertyRule::new(Filter::PrivateTmp, PolicyArg::Bool("no".into())),
        ];
        assert_eq!(
            compile_properties(&rules).unwrap(),
            strings(&[
                "--pipe",
                "--pty",
                "--user",
                "-p",
                "NoNewPrivileges=yes",
                "-p",
                "PrivateTmp=no",
            ])
        );
    }

    #[test]
    fn test_filter_json_passthrough() {
        let rule: PropertyRule = serde_json::from_str(
            r#"{"filter":"ProtectClock","arg":{"type":"bool","value":"yes"}}"#,
        )
        .unwrap();
        assert_eq!(rule.filter, Filter::Other("ProtectClock".into()));
        let known: Filter = serde_json::from_str(r#""PrivateTmp""#).unwrap();
        assert_eq!(known, Filter::PrivateTmp);
        assert_eq!(serde_json::to_string(&known).unwrap(), r#""PrivateTmp""#);
    }

    #[test]
    fn test_per_call_invocation() {
        let sandbox = LinuxSystemdRun::from_config(SystemdRunConfig {
            rules: vec![PropertyRule::new(
                Filter::PrivateTmp,
                PolicyArg::Bool("yes".into()),
            )],
            temp_dir: None,
        })
        .unwrap();
        let bind_src = tempfile::tempdir().unwrap();
        let host = bind_src.path().canonicalize().unwrap();

        let options = CommandOptions::new("ls")
            .with_args(vec!["/data".into()])
            .with_env("LANG", "C")
            .with_working_dir("/data")
            .with_bind(BindMount::read_only(bind_src.path(), "/data"))
            .with_bind(BindMount::new("/definitely/missing/path", "/gone"));
        let spec = sandbox.compile_invocation(&options).unwrap();

        assert_eq!(spec.program, "systemd-run");
        assert_eq!(
            spec.args,
            vec![
                "--pipe".to_string(),
                "--pty".to_string(),
                "--user".to_string(),
                "-p".to_string(),
                "PrivateTmp=yes".to_string(),
                "--setenv=LANG=C".to_string(),
                "--working-directory=/data".to_string(),
                "-p".to_string(),
                format!("BindReadOnlyPaths={}:/data", host.display()),
                "ls".to_string(),
                "/data".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let sandbox = LinuxSystemdRun::from_config(SystemdRunConfig::default()).unwrap();
        sandbox.clear().await.unwrap();
        sandbox.clear().await.unwrap();
        assert!(matches!(
            sandbox.run_source(&ExecContext::background(), "true").await,
            Err(SandboxError::Cleared(_))
        ));
    }

    #[tokio::test]
    async fn test_interrupted_source_leaves_no_staging() {
        let parent = tempfile::tempdir().unwrap();
        let sandbox = LinuxSystemdRun::from_config(SystemdRunConfig {
            temp_dir: Some(parent.path().to_path_buf()),
            ..SystemdRunConfig::default()
        })
        .unwrap();
        let instance = sandbox.instance.path().unwrap();

        let ctx = ExecContext::with_timeout(std::time::Duration::ZERO);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let err = sandbox.run_source(&ctx, "exit 3\n").await.unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));

        let leftovers: Vec<_> = std::fs::read_dir(&instance).unwrap().collect();
        assert!(leftovers.is_empty(), "left behind: {:?}", leftovers);
        sandbox.clear().await.unwrap();
    }
}

/*!
 * Bubblewrap Backend Tests
 * Run only where unprivileged user namespaces are available
 */

#![cfg(target_os = "linux")]

use pretty_assertions::assert_eq;
use sandboxer::sandbox::backends::{BubblewrapConfig, BubblewrapProbe, LinuxBubblewrap};
use sandboxer::{
    BindMount, CapabilityProbe, CommandOptions, ExecContext, InstanceState, Sandbox,
    SandboxError,
};
use std::time::Duration;

async fn bubblewrap(mut config: BubblewrapConfig) -> Option<LinuxBubblewrap> {
    let status = BubblewrapProbe.is_enabled().await;
    if !status.available {
        eprintln!("skipping: bubblewrap unavailable: {:?}", status.error);
        return None;
    }
    config.host_filesystem = true;
    Some(LinuxBubblewrap::new(config).await.unwrap())
}

#[tokio::test]
async fn test_network_is_isolated() {
    let config = BubblewrapConfig {
        unshare_network: true,
        ..Default::default()
    };
    let Some(sandbox) = bubblewrap(config).await else {
        return;
    };
    let result = sandbox
        .run(&ExecContext::background(), "cat /proc/net/dev")
        .await
        .unwrap();
    assert!(result.success(), "stderr: {}", result.stderr_lossy());

    // Two header lines plus loopback only
    assert_eq!(result.stdout_lossy().lines().count(), 3);
    sandbox.clear().await.unwrap();
}

#[tokio::test]
async fn test_per_call_bind_shadows_static_bind() {
    let static_dir = tempfile::tempdir().unwrap();
    let call_dir = tempfile::tempdir().unwrap();
    std::fs::write(static_dir.path().join("marker"), "static").unwrap();
    std::fs::write(call_dir.path().join("marker"), "per-call").unwrap();

    let config = BubblewrapConfig {
        read_only_binds: vec![BindMount::read_only(static_dir.path(), "/data")],
        ..Default::default()
    };
    let Some(sandbox) = bubblewrap(config).await else {
        return;
    };

    let options = CommandOptions::new("cat")
        .with_args(vec!["/data/marker".to_string()])
        .with_bind(BindMount::read_only(call_dir.path(), "/data"));
    let result = sandbox
        .run_with_options(&ExecContext::background(), options)
        .await
        .unwrap();
    assert_eq!(result.stdout_lossy(), "per-call");
    sandbox.clear().await.unwrap();
}

#[tokio::test]
async fn test_run_source_leaves_no_staging_behind() {
    let Some(sandbox) = bubblewrap(BubblewrapConfig::default()).await else {
        return;
    };
    let instance = sandbox.instance_path().unwrap();

    let result = sandbox
        .run_source(&ExecContext::background(), "echo staged\n")
        .await
        .unwrap();
    assert_eq!(result.stdout_lossy(), "staged\n");

    let leftovers: Vec<_> = std::fs::read_dir(&instance)
        .unwrap()
        .filter_map(Result::ok)
        .collect();
    assert!(leftovers.is_empty(), "left behind: {:?}", leftovers);

    sandbox.clear().await.unwrap();
    assert!(!instance.exists());
    assert_eq!(sandbox.state(), InstanceState::Cleared);
}

#[tokio::test]
async fn test_empty_command_is_rejected() {
    let Some(sandbox) = bubblewrap(BubblewrapConfig::default()).await else {
        return;
    };
    let err = sandbox.run(&ExecContext::background(), "").await.unwrap_err();
    assert!(err.is_config_invalid());
    sandbox.clear().await.unwrap();
}

#[tokio::test]
async fn test_deadline_kills_sandboxed_command() {
    let Some(sandbox) = bubblewrap(BubblewrapConfig::default()).await else {
        return;
    };
    let ctx = ExecContext::with_timeout(Duration::from_millis(300));
    let err = sandbox.run(&ctx, "sleep 30").await.unwrap_err();
    assert!(matches!(err, SandboxError::Timeout(_)));
    sandbox.clear().await.unwrap();
}

#[tokio::test]
async fn test_cleared_instance_refuses_work() {
    let Some(sandbox) = bubblewrap(BubblewrapConfig::default()).await else {
        return;
    };
    sandbox.clear().await.unwrap();
    sandbox.clear().await.unwrap();
    let err = sandbox.run(&ExecContext::background(), "true").await.unwrap_err();
    assert!(matches!(err, SandboxError::Cleared(_)));
}

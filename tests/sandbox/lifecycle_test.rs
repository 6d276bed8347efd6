/*!
 * Lifecycle Tests
 * Factory dispatch, clear semantics and platform gating
 */

use sandboxer::sandbox::backends::{SeatbeltConfig, WindowsSandboxConfig};
use sandboxer::sandbox::probe_for;
use sandboxer::{
    create, create_or_unsupported, BackendConfig, BackendKind, ExecContext, SandboxError,
};

#[tokio::test]
async fn test_foreign_platform_backend_is_not_implemented() {
    let ctx = ExecContext::background();
    let config = if cfg!(target_os = "macos") {
        BackendConfig::WindowsSandbox(WindowsSandboxConfig::default())
    } else {
        BackendConfig::Seatbelt(SeatbeltConfig::default())
    };

    let err = create(&ctx, config.clone()).await.err().unwrap();
    assert!(matches!(err, SandboxError::NotImplemented(_)));

    let sandbox = create_or_unsupported(&ctx, config).await.unwrap();
    assert!(matches!(
        sandbox.run_source(&ctx, "echo hi").await,
        Err(SandboxError::NotImplemented(_))
    ));
    sandbox.clear().await.unwrap();
}

#[tokio::test]
async fn test_toggle_on_builtin_features_fails() {
    for kind in [BackendKind::Seatbelt, BackendKind::SystemdRun, BackendKind::Bubblewrap] {
        let probe = probe_for(kind);
        assert!(matches!(
            probe.activate().await,
            Err(SandboxError::NotToggleable(_))
        ));
        assert!(matches!(
            probe.deactivate().await,
            Err(SandboxError::NotToggleable(_))
        ));
    }
}

#[tokio::test]
async fn test_probe_of_missing_tool_reports_not_installed() {
    if cfg!(target_os = "macos") {
        return;
    }
    let status = probe_for(BackendKind::Seatbelt).is_installed().await;
    assert!(!status.available);
    assert!(matches!(status.error, Some(SandboxError::NotInstalled(_))));
}

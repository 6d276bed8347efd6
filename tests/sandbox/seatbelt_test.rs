/*!
 * Seatbelt Backend Tests
 */

#![cfg(target_os = "macos")]

use sandboxer::sandbox::backends::{
    Action, DarwinSeatbelt, Scope, SeatbeltArg, SeatbeltConfig, SeatbeltProbe, SeatbeltRule,
};
use sandboxer::{CapabilityProbe, ExecContext, Sandbox};

#[tokio::test]
async fn test_denied_write_fails() {
    if !SeatbeltProbe.is_enabled().await.available {
        eprintln!("skipping: sandbox-exec unavailable");
        return;
    }
    let target = tempfile::tempdir().unwrap();
    let target_path = target.path().canonicalize().unwrap();
    let config = SeatbeltConfig {
        rules: vec![SeatbeltRule::new(Action::Deny, Scope::FileWrite)
            .with_arg(SeatbeltArg::Subpath(target_path.clone()))],
        ..Default::default()
    };
    let sandbox = DarwinSeatbelt::new(config).await.unwrap();
    let ctx = ExecContext::background();

    let denied = sandbox
        .run(&ctx, &format!("touch {}", target_path.join("blocked").display()))
        .await
        .unwrap();
    assert!(!denied.success());
    assert!(!target_path.join("blocked").exists());

    let allowed = sandbox.run(&ctx, "echo ok").await.unwrap();
    assert_eq!(allowed.stdout_lossy(), "ok\n");
    sandbox.clear().await.unwrap();
}

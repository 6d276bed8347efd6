/*!
 * Execution Protocol Tests
 * Launch, capture and interruption of sandbox launcher processes
 */

use sandboxer::sandbox::exec::{execute, ProcessSpec};
use sandboxer::{CancelToken, ExecContext, SandboxError};
use std::time::{Duration, Instant};

#[cfg(unix)]
#[tokio::test]
async fn test_non_zero_exit_is_data() {
    let spec = ProcessSpec::new("sh").with_args(["-c", "exit 7"]);
    let result = execute(&spec, &ExecContext::background()).await.unwrap();
    assert_eq!(result.exit_code, Some(7));
    assert!(matches!(
        result.ensure_success(),
        Err(SandboxError::RuntimeFailure { code: Some(7), .. })
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_cancel_token_kills_process() {
    let token = CancelToken::new();
    let ctx = ExecContext::background().with_cancel(token.clone());
    let spec = ProcessSpec::new("sleep").with_args(["30"]);

    let started = Instant::now();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        token.cancel();
    });
    let err = execute(&spec, &ctx).await.unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, SandboxError::Cancelled(_)));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[cfg(unix)]
#[tokio::test]
async fn test_expired_context_spawns_nothing() {
    let ctx = ExecContext::with_timeout(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let spec = ProcessSpec::new("/nonexistent/would-fail-to-launch");
    let err = execute(&spec, &ctx).await.unwrap_err();
    assert!(matches!(err, SandboxError::Timeout(_)));
}

#[tokio::test]
async fn test_missing_launcher_is_launch_failure() {
    let spec = ProcessSpec::new("definitely-not-a-sandbox-launcher");
    let err = execute(&spec, &ExecContext::background()).await.unwrap_err();
    assert!(matches!(err, SandboxError::LaunchFailure(_)));
}

/*!
 * Docker Backend Tests
 * Need a reachable engine and the alpine image (pulled on demand)
 */

use sandboxer::sandbox::backends::{DockerConfig, DockerContainer, DockerProbe};
use sandboxer::{CapabilityProbe, CommandOptions, ExecContext, ExecutionResult, Sandbox, SandboxError};

const IMAGE: &str = "alpine:latest";

async fn container() -> Option<DockerContainer> {
    let status = DockerProbe.is_enabled().await;
    if !status.available {
        eprintln!("skipping: docker unavailable: {:?}", status.error);
        return None;
    }
    Some(DockerContainer::new(DockerConfig::new(IMAGE)).await.unwrap())
}

/// Pull failures (offline hosts) skip instead of failing
fn skip_on_engine_error(outcome: Result<ExecutionResult, SandboxError>) -> Option<ExecutionResult> {
    match outcome {
        Err(SandboxError::Engine(e)) => {
            eprintln!("skipping: engine error: {}", e);
            None
        }
        other => Some(other.unwrap()),
    }
}

#[tokio::test]
async fn test_echo_in_container() {
    let Some(sandbox) = container().await else {
        return;
    };
    let outcome = sandbox.run(&ExecContext::background(), "echo hello").await;
    if let Some(result) = skip_on_engine_error(outcome) {
        assert!(result.success());
        assert_eq!(result.stdout_lossy(), "hello\n");
    }
    sandbox.clear().await.unwrap();
}

#[tokio::test]
async fn test_non_zero_exit_is_reported() {
    let Some(sandbox) = container().await else {
        return;
    };
    let options = CommandOptions::new("sh").with_args(vec!["-c".to_string(), "exit 3".to_string()]);
    let outcome = sandbox
        .run_with_options(&ExecContext::background(), options)
        .await;
    if let Some(result) = skip_on_engine_error(outcome) {
        assert_eq!(result.exit_code, Some(3));
    }
    sandbox.clear().await.unwrap();
}

#[tokio::test]
async fn test_source_runs_from_read_only_mount() {
    let Some(sandbox) = container().await else {
        return;
    };
    let outcome = sandbox
        .run_source(&ExecContext::background(), "echo from-script\n")
        .await;
    if let Some(result) = skip_on_engine_error(outcome) {
        assert_eq!(result.stdout_lossy(), "from-script\n");
    }
    sandbox.clear().await.unwrap();
}

/*!
 * Process Execution
 * Spawns a launcher process, captures its output and races it against the context
 */

use super::context::{ExecContext, Interrupt};
use super::types::ExecutionResult;
use crate::core::errors::{SandboxError, SandboxResult};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Fully compiled launcher invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    /// Added to the inherited environment of the launcher itself
    pub env: BTreeMap<String, String>,
    pub current_dir: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_stdin(mut self, stdin: Option<String>) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Program and arguments joined by spaces, for diagnostics only
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Run `spec` to completion or until `ctx` fires
///
/// A non-zero exit is `Ok`; only spawn and pipe failures and context
/// interruption are errors. On interruption the child's whole process group
/// is killed and reaped before returning.
pub async fn execute(spec: &ProcessSpec, ctx: &ExecContext) -> SandboxResult<ExecutionResult> {
    let command_line = spec.display();
    if let Some(interrupt) = ctx.interrupted() {
        return Err(interrupt.into_error(&command_line));
    }

    let mut child = spawn(spec).map_err(|e| {
        SandboxError::LaunchFailure(format!("{}: {}", spec.program, e))
    })?;
    debug!(command = %command_line, pid = ?child.id(), "spawned sandbox launcher");

    let stdin_pipe = child.stdin.take();
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let input = spec.stdin.clone();

    let outcome = {
        let collect = async {
            let write_stdin = async {
                if let (Some(mut pipe), Some(input)) = (stdin_pipe, input) {
                    match pipe.write_all(input.as_bytes()).await {
                        // The child may exit without reading its input
                        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                        other => other?,
                    }
                    // Dropping the pipe closes the child's stdin
                }
                Ok::<(), io::Error>(())
            };
            let read_stdout = async {
                let mut buf = Vec::new();
                if let Some(mut pipe) = stdout_pipe {
                    pipe.read_to_end(&mut buf).await?;
                }
                Ok::<Vec<u8>, io::Error>(buf)
            };
            let read_stderr = async {
                let mut buf = Vec::new();
                if let Some(mut pipe) = stderr_pipe {
                    pipe.read_to_end(&mut buf).await?;
                }
                Ok::<Vec<u8>, io::Error>(buf)
            };

            let ((), stdout, stderr) = tokio::try_join!(write_stdin, read_stdout, read_stderr)?;
            let status = child.wait().await?;
            Ok::<_, io::Error>((status, stdout, stderr))
        };
        ctx.run_until_done(collect).await
    };

    match outcome {
        Ok(Ok((status, stdout, stderr))) => {
            let mut result = ExecutionResult::new(command_line);
            result.stdout = stdout;
            result.stderr = stderr;
            result.set_exit(status.code(), describe_status(&status));
            Ok(result)
        }
        Ok(Err(e)) => {
            terminate(&mut child).await;
            Err(SandboxError::LaunchFailure(format!(
                "{}: i/o with sandboxed process failed: {}",
                spec.program, e
            )))
        }
        Err(interrupt) => {
            terminate(&mut child).await;
            Err(interrupted(interrupt, &command_line))
        }
    }
}

fn interrupted(interrupt: Interrupt, command_line: &str) -> SandboxError {
    debug!(command = %command_line, ?interrupt, "sandboxed process interrupted");
    interrupt.into_error(command_line)
}

fn spawn(spec: &ProcessSpec) -> io::Result<Child> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if spec.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }

    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    if let Some(ref dir) = spec.current_dir {
        cmd.current_dir(dir);
    }

    // Own process group so interruption reaches every descendant
    #[cfg(unix)]
    cmd.process_group(0);

    cmd.spawn()
}

/// Kill the child's process group and reap it
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Ok(raw) = i32::try_from(pid) {
            if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
                debug!(pid, error = %e, "killpg failed, falling back to child kill");
            }
        }
    }

    if let Err(e) = child.kill().await {
        // Already exited and reaped
        if e.kind() != io::ErrorKind::InvalidInput {
            warn!(error = %e, "failed to kill sandboxed process");
        }
    }
}

#[cfg(unix)]
fn describe_status(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    if status.success() {
        return None;
    }
    match (status.code(), status.signal()) {
        (Some(code), _) => Some(format!("exit status {}", code)),
        (None, Some(signal)) => Some(format!("terminated by signal {}", signal)),
        (None, None) => None,
    }
}

#[cfg(not(unix))]
fn describe_status(status: &ExitStatus) -> Option<String> {
    if status.success() {
        None
    } else {
        status.code().map(|code| format!("exit status {}", code))
    }
}

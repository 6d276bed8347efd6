/*!
 * Sandboxer - Command Line Entry Point
 *
 * Subcommands:
 * - probe: report which backends are installed and enabled
 * - run: execute a command inside a configured backend
 * - source: execute a script file as staged source
 */

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, WrapErr};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};

use sandboxer::{
    create, init_tracing, load_backend_config, CancelToken, CommandOptions, ExecContext,
    ExecutionResult, Sandbox, Settings,
};

#[derive(Debug, Parser)]
#[command(name = "sandboxer", version, about = "Run commands inside OS sandboxes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Report installed and enabled state of every backend
    Probe {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a command inside the configured backend
    Run {
        /// Backend configuration (JSON, tagged by "backend")
        #[arg(long)]
        config: PathBuf,
        /// Deadline in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Stage a script file and run it inside the configured backend
    Source {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        timeout: Option<u64>,
        script: PathBuf,
    },
}

enum Job {
    Command(CommandOptions),
    Source(String),
}

#[tokio::main]
async fn main() -> miette::Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let settings = Settings::from_env()?;

    match cli.command {
        Command::Probe { json } => probe(json).await,
        Command::Run {
            config,
            timeout,
            command,
        } => {
            let mut parts = command.into_iter();
            let program = parts
                .next()
                .ok_or_else(|| miette::miette!("a command is required"))?;
            let options = CommandOptions::new(program).with_args(parts.collect());
            execute(&settings, config, timeout, Job::Command(options)).await
        }
        Command::Source {
            config,
            timeout,
            script,
        } => {
            let source = std::fs::read_to_string(&script)
                .into_diagnostic()
                .wrap_err_with(|| format!("reading {}", script.display()))?;
            execute(&settings, config, timeout, Job::Source(source)).await
        }
    }
}

async fn probe(json: bool) -> miette::Result<ExitCode> {
    let reports = sandboxer::sandbox::probe_all().await;
    if json {
        let rendered = serde_json::to_string_pretty(&reports).into_diagnostic()?;
        println!("{}", rendered);
        return Ok(ExitCode::SUCCESS);
    }

    println!("{:<16} {:<10} {:<10} {:<8}", "BACKEND", "SUPPORTED", "INSTALLED", "ENABLED");
    for report in &reports {
        println!(
            "{:<16} {:<10} {:<10} {:<8}",
            report.kind.as_str(),
            yes_no(report.supported),
            yes_no(report.installed.available),
            yes_no(report.enabled.available),
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

async fn execute(
    settings: &Settings,
    config_path: PathBuf,
    timeout: Option<u64>,
    job: Job,
) -> miette::Result<ExitCode> {
    let config = load_backend_config(&config_path)?.with_default_temp_dir(settings.temp_dir.clone());

    let token = CancelToken::new();
    let mut ctx = ExecContext::background().with_cancel(token.clone());
    if let Some(deadline) = timeout.map(Duration::from_secs).or(settings.default_timeout) {
        ctx = ctx.timeout(deadline);
    }

    // Ctrl-C cancels the in-flight run; the child is killed by the executor
    let canceller = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            token.cancel();
        }
    });

    let sandbox = create(&ctx, config).await?;
    info!(backend = sandbox.kind().as_str(), "sandbox ready");

    let outcome = match job {
        Job::Command(options) => sandbox.run_with_options(&ctx, options).await,
        Job::Source(source) => sandbox.run_source(&ctx, &source).await,
    };
    let cleared = sandbox.clear().await;
    canceller.abort();

    if let Err(e) = cleared {
        warn!(error = %e, "sandbox cleanup failed");
    }
    report(&outcome?)
}

fn report(result: &ExecutionResult) -> miette::Result<ExitCode> {
    std::io::stdout().write_all(&result.stdout).into_diagnostic()?;
    std::io::stderr().write_all(&result.stderr).into_diagnostic()?;

    let code = result.exit_code_or(-1);
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

/*!
 * Run Tracing
 * Structured tracing for sandbox runs using the tracing crate
 *
 * Features:
 * - Run ID generation for correlating one call across backend logs
 * - JSON-formatted logs for structured parsing
 * - Per-run spans carrying backend, exit code and duration
 */

use std::time::Instant;
use tracing::{debug, info, span, Level, Span};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};
use uuid::Uuid;

/// Environment variable switching the subscriber to JSON output
pub const LOG_JSON_ENV: &str = "SANDBOXER_LOG_JSON";

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - SANDBOXER_LOG_JSON: Enable JSON output (default: false)
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var(LOG_JSON_ENV)
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    // try_init: a second call (tests, embedding) keeps the first subscriber
    if use_json {
        let _ = registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_writer(std::io::stderr),
            )
            .try_init();
    } else {
        let _ = registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_writer(std::io::stderr)
                    .compact(),
            )
            .try_init();
    }
}

/// Generate a unique run ID for correlation
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span covering one `run`/`run_source` call
///
/// The inner span is meant to be attached to the run future with
/// `tracing::Instrument`; the outcome is recorded once the future resolves.
pub struct RunSpan {
    span: Span,
    start: Instant,
    run_id: String,
}

impl RunSpan {
    pub fn new(backend: &'static str, operation: &'static str) -> Self {
        let run_id = generate_run_id();
        let span = span!(
            Level::INFO,
            "sandbox.run",
            run_id = %run_id,
            backend = backend,
            operation = operation,
            exit_code = tracing::field::Empty,
            error = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        );

        Self {
            span,
            start: Instant::now(),
            run_id,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Clone of the underlying span for `Instrument`
    pub fn span(&self) -> Span {
        self.span.clone()
    }

    /// Record a finished process
    pub fn record_exit(&self, exit_code: Option<i32>) {
        match exit_code {
            Some(code) => {
                self.span.record("exit_code", code);
            }
            None => {
                self.span.record("exit_code", "signal");
            }
        }
    }

    /// Record a call that produced no result
    pub fn record_error(&self, error: &dyn std::fmt::Display) {
        self.span.record("error", tracing::field::display(error));
    }
}

impl Drop for RunSpan {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        self.span.record("duration_ms", duration.as_millis() as u64);
        let _entered = self.span.enter();
        debug!(run_id = %self.run_id, duration_ms = duration.as_millis() as u64, "run finished");
    }
}

/// Log a compiled backend artifact (profile text, argument vector, descriptor)
pub fn trace_compiled(backend: &'static str, artifact: &str) {
    debug!(backend, artifact, "compiled sandbox policy");
}

/// Log instance construction
pub fn trace_instance_created(backend: &'static str) {
    info!(backend, "sandbox instance configured");
}

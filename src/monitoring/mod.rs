/*!
 * Monitoring
 * Structured logging and per-run tracing
 */

mod tracer;

pub use tracer::{
    generate_run_id, init_tracing, trace_compiled, trace_instance_created, RunSpan, LOG_JSON_ENV,
};

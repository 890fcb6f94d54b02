//! Purpose: Install the process-wide `tracing` subscriber for the CLI and the C ABI.
//! Exports: `init`, `LOG_ENV`, `DEFAULT_FILTER`.
//! Role: One place that decides filter, writer and span events.
//! Invariants: Installing twice is a no-op; the first subscriber wins.
//! Invariants: Diagnostics go to stderr so stdout stays a clean JSON payload.
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

pub const LOG_ENV: &str = "MESHBRIDGE_LOG";
pub const DEFAULT_FILTER: &str = "warn";

/// `filter` overrides `MESHBRIDGE_LOG`; an unparsable filter falls back to `warn`.
pub fn init(filter: Option<&str>) {
    let env_filter = match filter {
        Some(filter) => EnvFilter::try_new(filter).ok(),
        None => EnvFilter::try_from_env(LOG_ENV).ok(),
    }
    .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .try_init();
}

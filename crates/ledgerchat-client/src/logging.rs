use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str =
    "ledgerchat_client=debug,ledgerchat_net=debug,ledgerchat_store=info,warn";

/// Install the global tracing subscriber (respects `RUST_LOG`).
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

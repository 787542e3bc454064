//! tracing subscriber setup

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "ephemeral_server=debug";

fn filter() -> EnvFilter {
    let filter = EnvFilter::from_default_env();
    match DEFAULT_DIRECTIVE.parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

/// Install the subscriber for a binary; `RUST_LOG` extends the default filter
pub fn init() {
    tracing_subscriber::fmt().with_env_filter(filter()).init();
}

/// Install a subscriber that writes through the test harness. Safe to call from every test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_test_writer()
        .try_init();
}

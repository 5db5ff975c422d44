use tracing_subscriber::EnvFilter;

/// Initialises the global tracing subscriber. `RUST_LOG` overrides the
/// default level. Safe to call once; later calls are ignored.
pub fn setup_logging() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.try_init();
}

/// Test helper: install a subscriber that respects RUST_LOG without
/// panicking when multiple tests race to initialise it.
pub fn testing_logging() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_test_writer()
		.try_init();
}

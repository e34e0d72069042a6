use tracing_subscriber::EnvFilter;

/// Install the process-wide JSON logger. Filter directives are read from
/// `RUST_LOG`. Call once, from the embedding harness.
pub fn init_json_logger() {
	tracing_subscriber::fmt()
		.json()
		.with_env_filter(EnvFilter::from_default_env())
		.init();
}

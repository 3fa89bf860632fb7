use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber. Filtering follows `RUST_LOG`
/// (default `info`); `json` switches to machine-readable output for log
/// shippers.
pub fn init(json: bool) {
	let builder = tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
	if json {
		builder.json().init();
	} else {
		builder.init();
	}
}

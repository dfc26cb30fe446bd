use tracing_subscriber::EnvFilter;

const CRATE_NAMES: &[&str] = &["objbench", "objbench_cli", "objbench_engine"];

/// Installs a subscriber writing to the output captured by the test runner.
///
/// Without `RUST_LOG`, only objbench crates are logged, at all levels. Calling this more than
/// once is harmless.
///
/// # Example
///
/// ```
/// objbench_test::tracing::init();
/// ```
pub fn init() {
    let env_filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) => EnvFilter::new(directives),
        Err(_) => CRATE_NAMES
            .iter()
            .fold(EnvFilter::new("ERROR"), |filter, name| {
                filter.add_directive(format!("{name}=TRACE").parse().unwrap())
            }),
    };

    tracing_subscriber::fmt::fmt()
        .with_env_filter(env_filter)
        .with_test_writer()
        .compact()
        .try_init()
        .ok();
}

use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::settings::LoggingSettings;

const DEFAULT_LEVEL: &str = "info";

/// Builds the filter from `RUST_LOG` when set, otherwise from the configured
/// base level plus every module directive. Directives that do not parse are
/// left out and returned alongside the filter.
pub fn env_filter(logging: &LoggingSettings) -> (EnvFilter, Vec<String>) {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return (filter, Vec::new());
    }
    let mut rejected = Vec::new();
    let mut filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|e| {
        rejected.push(format!("level '{}': {}", logging.level, e));
        EnvFilter::new(DEFAULT_LEVEL)
    });
    for module_filter in &logging.module_filter {
        match module_filter.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => rejected.push(format!("'{}': {}", module_filter, e)),
        }
    }
    (filter, rejected)
}

/// Installs the global subscriber. A second call is a no-op.
pub fn init_tracing(logging: &LoggingSettings) {
    let (filter, rejected) = env_filter(logging);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .compact()
        .try_init();
    for directive in rejected {
        warn!("ignoring log directive {}", directive);
    }
}

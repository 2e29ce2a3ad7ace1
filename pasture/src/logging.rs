//! `tracing` subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// The filter directive implied by `config`. `debug_mode` forces `debug`.
#[must_use]
pub fn filter_directive(config: &Config) -> &'static str {
    if config.debug_mode {
        "debug"
    } else {
        config.log_level.as_directive()
    }
}

/// Installs a global `fmt` subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Returns false,
/// without panicking, if a subscriber is already installed.
pub fn init_tracing(config: &Config) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config)));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let installed = if config.log_json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.is_ok()
}

//! Log subscriber setup. Everything goes to stderr so stdout stays clean
//! for manifest output.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Install the global subscriber.
///
/// Precedence: `-v` flags, then `RUST_LOG`, then `default_directive`
/// (the config file's `log_level`). Calling it twice is harmless.
pub fn init(verbosity: u8, default_directive: &str) {
    let filter = build_filter(verbosity, default_directive, std::env::var("RUST_LOG").ok());

    let layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(verbosity > 1);

    // A subscriber may already be set (tests, embedding callers)
    let _ = Registry::default().with(filter).with(layer).try_init();
}

fn build_filter(verbosity: u8, default_directive: &str, env: Option<String>) -> EnvFilter {
    if verbosity > 0 {
        return EnvFilter::default().add_directive(level_from_verbosity(verbosity).into());
    }
    if let Some(directive) = env.filter(|d| !d.trim().is_empty()) {
        if let Ok(filter) = EnvFilter::try_new(&directive) {
            return filter;
        }
    }
    EnvFilter::try_new(default_directive)
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::WARN.into()))
}

fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

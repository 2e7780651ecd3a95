use std::env;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

pub const LOG_ENV: &str = "SNAPSPLIT_LOG";

fn filter_directive(verbose: bool) -> String {
    match env::var(LOG_ENV) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ if verbose => "debug".to_string(),
        _ => "info".to_string(),
    }
}

/// Compact logs on stderr so stdout stays free for reports.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_new(filter_directive(verbose)).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_target(false)
                .without_time(),
        )
        .with(filter)
        .try_init();
}

//! Tracing bootstrap for binaries

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Map `-q` / `-v` counts to a default filter level
pub fn level_for(quiet: bool, verbose: u8) -> &'static str {
    match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    }
}

/// Initialize logging. `RUST_LOG` wins over `default_level`.
pub fn init(default_level: &str) {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_for() {
        assert_eq!(level_for(true, 3), "error");
        assert_eq!(level_for(false, 0), "info");
        assert_eq!(level_for(false, 1), "debug");
        assert_eq!(level_for(false, 5), "trace");
    }
}

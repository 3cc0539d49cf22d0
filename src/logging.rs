use tracing_subscriber::EnvFilter;

/// Overrides every other verbosity setting when set.
pub const LOG_ENV_VAR: &str = "MAGNET_LOG";

/// Filter directive for the given verbosity, ignoring the environment.
pub fn filter_directive(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        return "warn";
    }
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install a stderr subscriber for the library's `tracing` events.
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var(LOG_ENV_VAR) {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(filter_directive(verbose, quiet))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_wins_over_verbose() {
        assert_eq!(filter_directive(2, true), "warn");
    }

    #[test]
    fn verbosity_levels() {
        assert_eq!(filter_directive(0, false), "info");
        assert_eq!(filter_directive(1, false), "debug");
        assert_eq!(filter_directive(5, false), "trace");
    }

    #[test]
    fn repeated_init_is_harmless() {
        init_tracing(0, true);
        init_tracing(1, false);
    }
}

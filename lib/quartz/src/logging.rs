pub use slog::{crit, debug, error, info, o, trace, warn, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds a terminal logger writing structured records to stderr at the requested
/// severity (`trace`, `debug`, `info`, `warning`, `error`, `critical`).
pub fn terminal(level: &str) -> Logger {
    let config = format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    );

    from_toml(&config)
}

/// Builds a logger from a TOML configuration snippet.
pub fn from_toml(config: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(config).expect("Invalid logger configuration");

    config.build_logger().expect("Logger construction failed")
}

/// Discarding logger for tests and defaults.
pub fn null() -> Logger {
    Logger::root(slog::Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_logger_builds() {
        let log = terminal("debug");
        debug!(log, "logger constructed"; "sink" => "terminal");
    }

    #[test]
    #[should_panic(expected = "Invalid logger configuration")]
    fn test_rejects_malformed_config() {
        let _ = from_toml("type = ");
    }
}

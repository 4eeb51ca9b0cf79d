//! Thin wrapper over `slog`/`sloggers` so the rest of the workspace logs
//! through one module. Components receive a `Logger` at construction and
//! derive children with `log.new(o!(...))`.

pub use slog::{b, debug, error, info, o, record, trace, warn};
pub use slog::{Discard, Drain, Logger};

use crate::config::BrokerConfig;
use sloggers::file::FileLoggerBuilder;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

fn severity(level: &str) -> Severity {
    match level {
        "trace" => Severity::Trace,
        "debug" => Severity::Debug,
        "warning" => Severity::Warning,
        "error" => Severity::Error,
        "critical" => Severity::Critical,
        _ => Severity::Info,
    }
}

/// Build the process root logger from the configuration. A configured
/// `info_log_file` selects a file sink; otherwise logs go to stderr.
pub fn root_logger(config: &BrokerConfig) -> Logger {
    let level = severity(&config.log_level);

    let built = match &config.info_log_file {
        Some(path) => FileLoggerBuilder::new(path).level(level).build(),
        None => TerminalLoggerBuilder::new()
            .level(level)
            .destination(Destination::Stderr)
            .build(),
    };

    built.unwrap_or_else(|_| Logger::root(Discard, o!()))
}

/// Silent logger for tests and for components constructed without a parent.
pub fn discard_logger() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;

    #[test]
    fn test_terminal_logger_builds() {
        let config = BrokerConfig::from_toml_str(
            "ipc_socket = \"/tmp/s\"\nauth_server_ip = \"127.0.0.1\"\nauth_server_port = 1\n",
        )
        .unwrap();

        let log = root_logger(&config);
        info!(log, "logger constructed"; "sink" => "terminal");
    }

    #[test]
    fn test_severity_mapping() {
        assert!(matches!(severity("debug"), Severity::Debug));
        assert!(matches!(severity("bogus"), Severity::Info));
    }
}

//! Logger initialization.
//!
//! A single `Stderr` appender with an [`EnvFilter`], since this coordinator
//! has no distributed-tracing consumer in scope.

use std::{io::IsTerminal, str::FromStr};

use jiff::{Zoned, tz::TimeZone};
use logforth::{append::Stderr, filter::EnvFilter, layout::Layout};

/// Timestamps every line in UTC, colored when stderr is a terminal.
#[derive(Debug)]
struct UtcLayout {
    no_color: bool,
}

impl Layout for UtcLayout {
    fn format(
        &self,
        record: &log::Record<'_>,
        _diagnostics: &[Box<dyn logforth::diagnostic::Diagnostic>],
    ) -> anyhow::Result<Vec<u8>> {
        let now = Zoned::now().with_time_zone(TimeZone::UTC);
        let level = if self.no_color {
            format!("{:>5}", record.level())
        } else {
            match record.level() {
                log::Level::Error => format!("\x1b[31m{:>5}\x1b[0m", record.level()),
                log::Level::Warn => format!("\x1b[33m{:>5}\x1b[0m", record.level()),
                log::Level::Info => format!("\x1b[32m{:>5}\x1b[0m", record.level()),
                log::Level::Debug => format!("\x1b[34m{:>5}\x1b[0m", record.level()),
                log::Level::Trace => format!("\x1b[35m{:>5}\x1b[0m", record.level()),
            }
        };

        Ok(format!("{} {level}  {}", now.strftime("%Y-%m-%dT%H:%M:%S%.6fZ"), record.args()).into_bytes())
    }
}

/// Initialize `log` with a filter sourced from `log_filter` (normally `RUST_LOG`).
pub fn init(log_filter: &str) {
    let layout = if std::io::stderr().is_terminal() {
        UtcLayout { no_color: false }
    } else {
        UtcLayout { no_color: true }
    };

    let filter =
        EnvFilter::from_str(log_filter).unwrap_or_else(|_| EnvFilter::from_str("info").expect("valid default filter"));

    logforth::builder()
        .dispatch(move |d| d.filter(filter).append(Stderr::default().with_layout(layout)))
        .apply();
}

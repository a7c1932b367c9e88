//! Tracing setup for the Hoard daemon and its tests.
//!
//! The storage clients underneath (sqlx, hyper, russh, opendal) are chatty at
//! `debug`, so they are held at `warn` unless `RUST_LOG` names them.

use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::Result;

/// Dependencies whose own logging is capped at `warn`.
const QUIET_TARGETS: &[&str] = &["sqlx", "hyper", "reqwest", "russh", "russh_sftp", "opendal"];

/// Level named by `level`; unknown names mean `info`.
fn parse_level(level: &str) -> Level {
    match level.trim().to_ascii_lowercase().as_str() {
        "warning" => Level::WARN,
        other => Level::from_str(other).unwrap_or(Level::INFO),
    }
}

/// Filter with `level` as the floor for hoard and the quiet targets capped.
///
/// Directives from `RUST_LOG` are applied last and win.
fn build_filter(level: &str) -> EnvFilter {
    let mut filter = EnvFilter::new(parse_level(level).as_str());
    for target in QUIET_TARGETS {
        if let Ok(directive) = format!("{target}=warn").parse() {
            filter = filter.add_directive(directive);
        }
    }
    if let Ok(env) = std::env::var(EnvFilter::DEFAULT_ENV) {
        for directive in env.split(',').filter_map(|d| d.trim().parse().ok()) {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Open `path` for appending, creating missing parent directories.
fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Install the daemon's subscriber.
///
/// Events go to stdout and, when `file` is set, are appended to it too.
pub fn init(config: &LoggingConfig) -> Result<()> {
    if config.file.is_empty() {
        init_console_only(&config.level);
        return Ok(());
    }

    let log_file = Arc::new(open_log_file(Path::new(&config.file))?);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout.and(log_file))
                .with_ansi(false)
                .with_target(true),
        )
        .with(build_filter(&config.level))
        .init();

    Ok(())
}

/// Install a stdout-only subscriber.
pub fn init_console_only(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(build_filter(level))
        .init();
}

/// Route events into the test harness output. Safe to call from every test.
pub fn init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(build_filter("debug"))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("TRACE"), Level::TRACE);
        assert_eq!(parse_level(" debug "), Level::DEBUG);
        assert_eq!(parse_level("warning"), Level::WARN);
        assert_eq!(parse_level("error"), Level::ERROR);
        assert_eq!(parse_level("loud"), Level::INFO);
        assert_eq!(parse_level(""), Level::INFO);
    }

    #[test]
    fn test_filter_caps_storage_clients() {
        let rendered = build_filter("debug").to_string();
        for target in QUIET_TARGETS {
            assert!(rendered.contains(&format!("{target}=warn")), "{rendered}");
        }
    }

    #[test]
    fn test_log_file_is_appended_in_nested_dir() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("logs").join("hoard.log");

        writeln!(open_log_file(&path).unwrap(), "first").unwrap();
        writeln!(open_log_file(&path).unwrap(), "second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn test_init_for_tests_is_idempotent() {
        init_for_tests();
        init_for_tests();
        tracing::debug!("still alive");
    }
}

//! Logging initialization

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use weld_core::config::LoggingConfig;

use crate::args::{Args, LogFormat};

/// Effective logging settings
#[derive(Debug, Clone, PartialEq, Eq)]
struct Settings {
    level: Level,
    format: LogFormat,
    file: Option<PathBuf>,
}

/// Merge CLI flags over the topology's `[logging]` section
///
/// `-v`/`--quiet`, `--log-format` and `--log-file` win when given.
fn resolve(args: &Args, config: &LoggingConfig) -> Settings {
    let level = if args.quiet {
        Level::ERROR
    } else {
        match args.verbose {
            0 => config.level().unwrap_or(Level::WARN),
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let format = args.log_format.unwrap_or(if config.json_format {
        LogFormat::Json
    } else {
        LogFormat::Text
    });

    let file = args
        .log_file
        .clone()
        .or_else(|| config.file.as_ref().map(PathBuf::from));

    Settings { level, format, file }
}

/// Initialize logging based on CLI arguments and the topology's defaults
///
/// Console logs go to stderr so command output on stdout stays clean.
/// The returned guard flushes the log file and must be held until exit.
pub fn init(args: &Args, config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let settings = resolve(args, config);

    // Build env filter
    let env_filter = EnvFilter::builder()
        .with_default_directive(settings.level.into())
        .from_env_lossy();

    let (file_writer, guard) = match settings.file {
        Some(ref path) => {
            let name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    // Set up subscriber based on format
    match settings.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(args.verbose >= 2)
                        .with_thread_names(args.verbose >= 3)
                        .with_file(args.verbose >= 3)
                        .with_line_number(args.verbose >= 3),
                )
                .with(file_writer.map(|w| fmt::layer().with_ansi(false).with_writer(w)))
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .with(file_writer.map(|w| fmt::layer().json().with_writer(w)))
                .init();
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .with(file_writer.map(|w| fmt::layer().compact().with_ansi(false).with_writer(w)))
                .init();
        }
    }

    Ok(guard)
}

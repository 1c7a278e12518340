//! Tracing setup: a console layer on stderr plus a daily-rolling JSON file
//! under the project's log directory.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_PREFIX: &str = "fleetpatch.log";

/// Console log format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }))
}

/// Install the global subscriber. `RUST_LOG` wins over `verbose`.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// life of the process. A second call is a no-op.
pub fn init_logging(format: LogFormat, verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let (file_layer, guard) = match log_dir {
        Some(dir) if std::fs::create_dir_all(dir).is_ok() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    let (text_layer, json_layer) = match format {
        LogFormat::Text => (
            Some(fmt::layer().with_target(false).with_writer(std::io::stderr)),
            None,
        ),
        LogFormat::Json => (None, Some(fmt::layer().json().with_writer(std::io::stderr))),
    };

    tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init()
        .ok();

    guard
}

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

const DEFAULT_FILTER: &str = "info,mirage=debug,mirage_core=debug,mirage_net=debug";

/// Installs the global subscriber. With a log directory, output goes to a
/// daily-rotated `mirage.log` there and the returned guard must be kept
/// alive until exit so buffered lines are flushed.
pub fn init_tracing(format: LogFormat, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.into());
    let env_filter = EnvFilter::new(filter);

    let (writer, guard, ansi) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mirage.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard), false)
        }
        None => (BoxMakeWriter::new(std::io::stdout), None, true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer)
        .with_ansi(ansi);

    match format {
        LogFormat::Json => builder.json().flatten_event(true).init(),
        LogFormat::Compact => builder.compact().init(),
    }

    guard
}

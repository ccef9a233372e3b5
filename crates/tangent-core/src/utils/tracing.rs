use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

use crate::config::LoggingConfig;

/// Install the global subscriber.
///
/// RUST_LOG wins over `config.level`. With `config.directory` set, logs go to
/// a daily file there and the returned guard must be held until exit so the
/// writer can flush.
pub fn init_tracing(config: &LoggingConfig) -> io::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.directory {
        Some(directory) => init_file_tracing(directory, filter).map(Some),
        None => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    fmt::Layer::default()
                        .with_writer(io::stderr)
                        .with_target(true),
                )
                .with(filter);
            set_global(subscriber)?;
            tracing::debug!(
                target: "tangent::utils::tracing",
                "Tracing initialized with stderr output"
            );
            Ok(None)
        }
    }
}

fn init_file_tracing(directory: &Path, filter: EnvFilter) -> io::Result<WorkerGuard> {
    std::fs::create_dir_all(directory)?;
    let (writer, guard) = tracing_appender::non_blocking(rolling::daily(directory, "tangent.log"));

    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::Layer::new()
                .with_writer(writer)
                .with_ansi(false)
                .with_span_events(FmtSpan::CLOSE)
                .with_file(true)
                .with_line_number(true),
        )
        .with(filter);
    set_global(subscriber)?;

    tracing::debug!(
        target: "tangent::utils::tracing",
        directory = %directory.display(),
        "Tracing initialized with file output"
    );
    Ok(guard)
}

fn set_global<S>(subscriber: S) -> io::Result<()>
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    tracing::subscriber::set_global_default(subscriber).map_err(io::Error::other)
}

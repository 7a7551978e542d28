use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info,sqlx::query=warn,lapin=warn";

/// Installs the global subscriber: daily-rotated JSON file plus human-readable stdout.
///
/// The returned guard flushes the file writer on drop, so binaries keep it alive
/// until they exit.
pub fn init_logging(log_dir: &str, file_name: &str) -> WorkerGuard {
    let file_appender = rolling::daily(log_dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .json();

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    // RUST_LOG wins when set
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    guard
}

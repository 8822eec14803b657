use std::io;
use std::path::Path;

use dotenv::dotenv;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use super::AppResult;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Keeps the non-blocking file writer alive; pending lines are flushed on drop.
pub struct TracingGuard {
    _worker_guard: WorkerGuard,
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        tracing::info!("shutdown file tracing writer");
    }
}

/// Console-only tracing, filtered by `RUST_LOG` (read from `.env` when present).
///
/// Calling it more than once is harmless: the first subscriber wins.
pub fn setup_local_tracing() -> AppResult<()> {
    // load .env
    dotenv().ok();
    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    Ok(())
}

/// Console plus hourly rolling file output under `log_dir`.
pub fn setup_tracing<P: AsRef<Path>>(log_dir: P, file_prefix: &str) -> AppResult<TracingGuard> {
    dotenv().ok();
    let file_appender = tracing_appender::rolling::hourly(log_dir, file_prefix);
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);

    // write to both the console and the file
    let writer = non_blocking.and(io::stdout);

    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(true)
        .with_writer(writer);

    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    Ok(TracingGuard {
        _worker_guard: worker_guard,
    })
}

//! `parxfer`: a parallel command-line driver for bulk object-storage operations. The binary
//! (`src/main.rs`) is a thin shell around [`dispatch::run`]; this crate is organized the way
//! `storage_scrubber` separates its library surface from its `main.rs` CLI glue.

pub mod batch_delete;
pub mod dispatch;
pub mod error;
pub mod expander;
pub mod job;
pub mod log;
pub mod pool;
pub mod stats;
pub mod url;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initializes the global `tracing` subscriber: a stderr layer plus an optional non-blocking
/// rolling file layer, mirroring `storage_scrubber::init_logging`. Returns the file layer's
/// guard, which must be held for the process lifetime to flush buffered log lines on exit.
pub fn init_logging(file_name: &str) -> Option<WorkerGuard> {
    let stderr_logs = fmt::Layer::new()
        .with_target(false)
        .with_writer(std::io::stderr);

    let disable_file_logging = match std::env::var("PARXFER_DISABLE_FILE_LOGGING") {
        Ok(s) => s == "1" || s.to_lowercase() == "true",
        Err(_) => false,
    };

    if disable_file_logging {
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stderr_logs)
            .init();
        None
    } else {
        let (file_writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::never("./logs/", file_name));
        let file_logs = fmt::Layer::new()
            .with_target(false)
            .with_ansi(false)
            .with_writer(file_writer);
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stderr_logs)
            .with(file_logs)
            .init();
        Some(guard)
    }
}

//! Tracing setup (spec.md §1 ambient stack): an `EnvFilter`-driven
//! stdout layer, plus an optional non-blocking file layer when a log
//! directory is configured.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub fn subscribe_log(log_mask: &str, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_new(log_mask).unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_ansi(true).with_filter(env_filter);

    match log_dir {
        Some(dir) => {
            if let Err(e) = std::fs::create_dir_all(dir) {
                eprintln!("failed to create log dir {dir:?}: {e}");
                tracing_subscriber::registry().with(stdout_layer).init();
                return None;
            }
            let appender = tracing_appender::rolling::daily(dir, "sai-server.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().json().with_ansi(false).with_writer(non_blocking);
            tracing_subscriber::registry()
                .with(stdout_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(stdout_layer).init();
            None
        }
    }
}

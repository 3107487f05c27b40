//! Structured logging setup.
//!
//! Console output honors `RUST_LOG`; an optional rolling file layer writes
//! newline-delimited JSON for later inspection.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::errors::Result;

/// Initialize the global subscriber.
///
/// Returns the appender guard when file logging is enabled; dropping it
/// flushes and stops the background writer, so hold it for the process
/// lifetime.
pub fn init_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,swarm_infer=debug"));

    let console = fmt::layer().with_target(false);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "node.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = fmt::layer().json().with_writer(writer);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(console)
                .with(file)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console)
                .init();
            Ok(None)
        }
    }
}

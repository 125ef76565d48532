//! Tracing subscriber setup.
//!
//! `log` records from the library are routed through tracing, so spans
//! opened by the reconciler and the recovery scanner show up on both.
//! Output goes to stderr; stdout carries the event stream.

use studyflow::LogFormat;
use tracing_subscriber::EnvFilter;

pub fn init(format: LogFormat) {
    tracing_log::LogTracer::init().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = match format {
        LogFormat::Json => {
            tracing::subscriber::set_global_default(builder.json().with_target(false).finish())
        }
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish()),
    };
    if let Err(e) = result {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

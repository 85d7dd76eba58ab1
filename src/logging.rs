use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::{Error, Result};

static INIT: Once = Once::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Silent,
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

/// Initialize the logging system. Safe to call more than once; only the
/// first call takes effect.
pub fn init_logging(level: LogLevel) -> Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = init_logging_inner(level);
    });
    result
}

fn init_logging_inner(level: LogLevel) -> Result<()> {
    let tracing_level = match level {
        LogLevel::Silent => return Ok(()),
        LogLevel::Error => Level::ERROR,
        LogLevel::Warning => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(
            format!("wirebind={}", tracing_level)
                .parse()
                .map_err(|e| Error::config(format!("invalid log directive: {}", e)))?,
        )
        .add_directive(
            "tokio=warn"
                .parse()
                .map_err(|e| Error::config(format!("invalid log directive: {}", e)))?,
        );

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .with_filter(filter);

    // try_init so an embedding application's subscriber wins
    let _ = tracing_subscriber::registry().with(fmt_layer).try_init();
    Ok(())
}

// ===============================
// src/logging.rs
// ===============================
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::config::{LogConfig, LogFormat, LogRotation};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// RUST_LOG wins over LOG_LEVEL when set.
pub fn filter(cfg: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level))
}

/// Console is always on; LOG_FILE adds a non-blocking rolling file sink.
/// Keep the returned guard alive for the process lifetime.
pub fn init(cfg: &LogConfig) -> Option<WorkerGuard> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let console = fmt::layer().with_target(false);
    layers.push(match cfg.format {
        LogFormat::Json => console.json().boxed(),
        LogFormat::Text => console.boxed(),
    });

    let mut guard = None;
    if let Some(path) = &cfg.file {
        let p = Path::new(path);
        let dir = p.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
        let name = p.file_name().map(|n| n.to_os_string()).unwrap_or_else(|| "dca_bot.log".into());
        let appender = match cfg.rotation {
            LogRotation::Daily => rolling::daily(dir, name),
            LogRotation::Hourly => rolling::hourly(dir, name),
            LogRotation::Never => rolling::never(dir, name),
        };
        let (writer, g) = tracing_appender::non_blocking(appender);
        guard = Some(g);
        let file = fmt::layer().with_ansi(false).with_writer(writer);
        layers.push(match cfg.format {
            LogFormat::Json => file.json().boxed(),
            LogFormat::Text => file.boxed(),
        });
    }

    // already initialised (tests) is not an error
    let _ = tracing_subscriber::registry().with(layers).with(filter(cfg)).try_init();
    guard
}

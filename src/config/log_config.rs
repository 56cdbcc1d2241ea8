use std::sync::OnceLock;

use serde::Deserialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

const FORMAT_PRETTY: &str = "pretty";
const FORMAT_COMPACT: &str = "compact";
const FORMAT_FULL: &str = "full";

/// Handle used by the `SET LOGLEVEL` control verb to swap the filter at
/// runtime.
static RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

#[derive(Deserialize, Clone, Debug)]
pub struct LogConfig {
    #[serde(default = "default_filter_level")]
    pub filter_level: String,
    #[serde(default = "default_true")]
    pub with_ansi: bool,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_true")]
    pub with_level: bool,
    #[serde(default = "default_true")]
    pub with_target: bool,
    #[serde(default = "default_true")]
    pub with_thread_ids: bool,
    #[serde(default = "default_true")]
    pub with_thread_names: bool,
    #[serde(default = "default_true")]
    pub with_source_location: bool,
}

fn default_filter_level() -> String {
    "info".into()
}

fn default_format() -> String {
    FORMAT_FULL.into()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter_level: default_filter_level(),
            with_ansi: true,
            format: default_format(),
            with_level: true,
            with_target: true,
            with_thread_ids: true,
            with_thread_names: true,
            with_source_location: true,
        }
    }
}

impl LogConfig {
    /// Init tracing.
    ///
    /// Caller should hold the guard.
    pub fn guard(&self) -> WorkerGuard {
        let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or(EnvFilter::new(&self.filter_level));
        let (filter, handle) = reload::Layer::new(filter);

        let fmt_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(self.with_ansi)
            .with_level(self.with_level)
            .with_target(self.with_target)
            .with_thread_ids(self.with_thread_ids)
            .with_thread_names(self.with_thread_names)
            .with_file(self.with_source_location)
            .with_line_number(self.with_source_location);

        match &*self.format {
            FORMAT_PRETTY => tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer.pretty())
                .init(),
            FORMAT_COMPACT => tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer.compact())
                .init(),
            _ => tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .init(),
        }

        let _ = RELOAD_HANDLE.set(handle);

        // Caller should hold this handler.
        guard
    }
}

/// Swap the active log filter. Returns the error text when the directive
/// does not parse or logging was never initialized.
pub fn set_filter(directive: &str) -> Result<(), String> {
    let filter = EnvFilter::try_new(directive).map_err(|e| e.to_string())?;
    let handle = RELOAD_HANDLE
        .get()
        .ok_or_else(|| "logging not initialized".to_owned())?;
    handle.reload(filter).map_err(|e| e.to_string())
}

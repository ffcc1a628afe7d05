//! Tracing subscriber installation.
//!
//! The library itself only ever emits [`tracing`] events — it never installs
//! a global subscriber on its own, since a library dictating its host
//! process's logging setup is a classic footgun. `init_default`/`init` are
//! offered as opt-in helpers for binaries (and tests) embedding this crate
//! directly, the same role `server/observability` plays for the rest of
//! the workspace this crate was split out of, minus the OTLP/Prometheus
//! exporters that ambient stack does not need here.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(format!("unsupported log format: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Installs a global subscriber built from `config`. Returns an error
/// rather than panicking if a subscriber is already installed, so tests
/// that call this more than once in the same process don't abort.
pub fn init(config: &TracingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.log_format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).try_init(),
    };
    result.map_err(|err| err.to_string())
}

/// Convenience wrapper over `init` reading `RUST_LOG`-style defaults.
pub fn init_default() -> Result<(), String> {
    init(&TracingConfig::default())
}

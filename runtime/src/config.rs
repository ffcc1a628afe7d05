//! Layered runtime configuration: a bundled `default.toml`, an optional
//! profile file, environment variables under the `NOA_RUNTIME__` prefix,
//! and finally explicit CLI/programmatic overrides — in that precedence
//! order, lowest to highest.

use std::path::{Path, PathBuf};

use config::{Config, ConfigError as BuilderError, Environment, File, FileFormat};
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_CONFIG_DIR: &str = "runtime/config";

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    pub runtime: RuntimeSection,
    pub observability: ObservabilitySection,
    #[serde(default)]
    pub distributed: DistributedSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeSection {
    #[serde(default = "default_queue_warn_threshold")]
    pub queue_warn_threshold: usize,
}

fn default_queue_warn_threshold() -> usize {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilitySection {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DistributedSection {
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_initial_backoff_ms")]
    pub retry_initial_backoff_ms: u64,
    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
    #[serde(default = "default_host_bind_address")]
    pub host_bind_address: String,
}

fn default_host_bind_address() -> String {
    "127.0.0.1:0".into()
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_initial_backoff_ms() -> u64 {
    10
}

fn default_retry_max_backoff_ms() -> u64 {
    5_000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub profile: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub queue_warn_threshold: Option<usize>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Builder(#[from] BuilderError),
}

pub fn load(overrides: ConfigOverrides) -> std::result::Result<RuntimeConfig, ConfigError> {
    let mut builder = Config::builder();
    builder = builder.add_source(required_file(DEFAULT_CONFIG_DIR, "default.toml"));

    if let Some(profile) = overrides.profile.as_deref() {
        let profile_file = format!("{profile}.toml");
        builder = builder.add_source(optional_file(DEFAULT_CONFIG_DIR, &profile_file));
    }

    if let Some(path) = overrides.config_path {
        builder = builder.add_source(File::from(path));
    }

    builder = builder.add_source(Environment::with_prefix("NOA_RUNTIME").separator("__"));

    if let Some(log_level) = overrides.log_level {
        builder = builder.set_override("observability.log_level", log_level)?;
    }
    if let Some(log_format) = overrides.log_format {
        builder = builder.set_override("observability.log_format", log_format)?;
    }
    if let Some(queue_warn_threshold) = overrides.queue_warn_threshold {
        builder = builder.set_override("runtime.queue_warn_threshold", queue_warn_threshold as i64)?;
    }

    let config = builder.build()?;
    Ok(config.try_deserialize()?)
}

fn required_file(dir: &str, name: &str) -> File<config::FileSourceFile, FileFormat> {
    File::from(Path::new(dir).join(name)).format(FileFormat::Toml)
}

fn optional_file(dir: &str, name: &str) -> File<config::FileSourceFile, FileFormat> {
    File::from(Path::new(dir).join(name))
        .required(false)
        .format(FileFormat::Toml)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_take_precedence_over_file_defaults() {
        let mut overrides = ConfigOverrides::default();
        overrides.log_level = Some("debug".into());
        overrides.queue_warn_threshold = Some(500);
        // Without a bundled default.toml on the test filesystem the
        // required_file source is missing, so this only exercises the
        // override plumbing rather than a full successful `load()`.
        let result = load(overrides);
        assert!(result.is_err());
    }
}

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::HarvestError;
use crate::models::{parse_datestamp, Granularity, HarvestContext, HarvestWindow};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1000
}
fn default_user_agent() -> String {
    format!("oai-harvest/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One `[targets.<name>]` table: a repository endpoint plus harvest options.
#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    pub url: String,
    #[serde(default = "default_metadata_prefix")]
    pub metadata_prefix: String,
    #[serde(default)]
    pub set_spec: Option<String>,
    #[serde(default = "default_granularity")]
    pub granularity: String,
    #[serde(default)]
    pub ignore_deleted: bool,
    /// Overrides the derived checkpoint alias.
    #[serde(default)]
    pub alias: Option<String>,
    /// Fixed start of the window (`YYYY-MM-DD` or `YYYY-MM-DDThh:mm:ssZ`).
    #[serde(default)]
    pub from_date: Option<String>,
    #[serde(default)]
    pub until_date: Option<String>,
}

fn default_metadata_prefix() -> String {
    "oai_dc".to_string()
}
fn default_granularity() -> String {
    Granularity::SECONDS.to_string()
}

impl TargetConfig {
    /// Build the immutable harvest context for this target.
    ///
    /// Fails with [`HarvestError::Config`] on an unrecognised granularity.
    pub fn context(&self, name: &str) -> Result<HarvestContext, HarvestError> {
        if self.url.trim().is_empty() {
            return Err(HarvestError::config(format!(
                "targets.{}.url must not be empty",
                name
            )));
        }
        let granularity: Granularity = self.granularity.parse()?;
        Ok(HarvestContext::new(name, self.url.trim(), &self.metadata_prefix)
            .with_set(self.set_spec.clone())
            .with_granularity(granularity)
            .ignore_deleted(self.ignore_deleted)
            .with_alias(self.alias.clone()))
    }

    /// The configured window, before checkpoint seeding.
    pub fn window(&self) -> Result<HarvestWindow, HarvestError> {
        Ok(HarvestWindow::new(
            self.from_date.as_deref().map(parse_date_arg).transpose()?,
            self.until_date.as_deref().map(parse_date_arg).transpose()?,
        ))
    }
}

/// Parse a user-supplied date (`YYYY-MM-DD` or `YYYY-MM-DDThh:mm:ssZ`).
pub fn parse_date_arg(value: &str) -> Result<DateTime<Utc>, HarvestError> {
    parse_datestamp(value).ok_or_else(|| {
        HarvestError::config(format!(
            "invalid date '{}'. Use {} or {}",
            value,
            Granularity::DAY,
            Granularity::SECONDS
        ))
    })
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.http.timeout_secs == 0 {
        anyhow::bail!("http.timeout_secs must be > 0");
    }
    if config.http.max_retries > 10 {
        anyhow::bail!("http.max_retries must be <= 10");
    }

    for (name, target) in &config.targets {
        if name == "all" {
            anyhow::bail!("'all' is reserved and cannot be used as a target name");
        }
        target
            .context(name)
            .with_context(|| format!("Invalid target '{}'", name))?;
        let window = target
            .window()
            .with_context(|| format!("Invalid target '{}'", name))?;
        if let (Some(from), Some(until)) = (window.from_date, window.until_date) {
            if from > until {
                anyhow::bail!("targets.{}: from_date is after until_date", name);
            }
        }
    }

    Ok(())
}

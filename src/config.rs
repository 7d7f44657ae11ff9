use crate::core::db::ReconnectPolicy;
use crate::core::{DalError, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Connection credentials from the bootstrap file.
///
/// The file holds exactly five lines, in order: hostname, port, username,
/// password, schema. No keys, no escaping.
#[derive(Clone, PartialEq)]
pub struct BootstrapConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub schema: String,
}

impl fmt::Debug for BootstrapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapConfig")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("schema", &self.schema)
            .finish()
    }
}

impl BootstrapConfig {
    /// Parses the positional five-line format.
    ///
    /// Any other line count, or a port that is not a number, is an error.
    pub fn parse(content: &str) -> Result<Self> {
        let lines: Vec<&str> = content
            .lines()
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .collect();
        if lines.len() != 5 {
            return Err(DalError::Config(format!(
                "bootstrap file must have exactly 5 lines, found {}",
                lines.len()
            )));
        }

        let port = lines[1].trim().parse::<u16>().map_err(|e| {
            DalError::Config(format!("invalid port '{}' in bootstrap file: {}", lines[1], e))
        })?;

        Ok(BootstrapConfig {
            hostname: lines[0].to_string(),
            port,
            username: lines[2].to_string(),
            password: lines[3].to_string(),
            schema: lines[4].to_string(),
        })
    }

    /// Reads and parses a bootstrap file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        BootstrapConfig::parse(&content)
    }
}

/// Top-level settings parsed from a TOML file. Every section is optional.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub reconnect: ReconnectSettings,
    pub cache: CacheSettings,
    pub logging: LoggingSettings,
}

/// Where the connection credentials and the database files live.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseSettings {
    pub bootstrap_file: PathBuf,
    pub data_dir: PathBuf,
    pub install_schema: bool,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            bootstrap_file: PathBuf::from("hmbot.cfg"),
            data_dir: PathBuf::from("."),
            install_schema: false,
        }
    }
}

/// Reconnect backoff.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub growth_factor: f64,
    pub budget_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        ReconnectSettings {
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            growth_factor: policy.growth_factor,
            budget_ms: policy.budget.as_millis() as u64,
            poll_interval_ms: policy.poll_interval.as_millis() as u64,
        }
    }
}

impl ReconnectSettings {
    pub fn policy(&self) -> Result<ReconnectPolicy> {
        if !(self.growth_factor >= 1.0 && self.growth_factor.is_finite()) {
            return Err(DalError::Config(format!(
                "reconnect.growth_factor must be at least 1.0, got {}",
                self.growth_factor
            )));
        }
        if self.initial_delay_ms == 0 {
            return Err(DalError::Config(
                "reconnect.initial_delay_ms must be positive".to_string(),
            ));
        }
        if self.budget_ms == 0 {
            return Err(DalError::Config(
                "reconnect.budget_ms must be positive".to_string(),
            ));
        }
        Ok(ReconnectPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            growth_factor: self.growth_factor,
            budget: Duration::from_millis(self.budget_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
        })
    }
}

/// Global option cache.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
    /// How long a cached global option stays fresh
    pub ttl_secs: u64,
    /// Replace the cached entry when a global option is written
    pub write_through: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            ttl_secs: 300,
            write_through: false,
        }
    }
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    /// `tracing_subscriber::EnvFilter` directives
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            filter: "info".to_string(),
        }
    }
}

/// Default settings location: `<config dir>/ircbot-dal/settings.toml`
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ircbot-dal").join("settings.toml"))
}

/// Loads settings from a TOML file at the given path.
pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings> {
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

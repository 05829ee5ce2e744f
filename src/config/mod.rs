pub mod schema;

pub use schema::{
    AccountConfig, Config, ConfigError, GatewayConfig, HandlerConfig, OutboundConfig, ReplyConfig,
    ReplyKind, RuleConfig, RuleKind, SecurityConfig,
};

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "WXGATE_CONFIG";

/// `<config dir>/wxgate/config.toml`, falling back to the working directory
/// when no config dir can be determined.
pub fn default_config_path() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.config_dir().join("wxgate").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("wxgate.toml"))
}

/// Explicit path, then `WXGATE_CONFIG`, then the default location. `~` and
/// `$VAR` references are expanded.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    let raw = match explicit {
        Some(path) => path.to_string_lossy().into_owned(),
        None => match std::env::var(CONFIG_ENV) {
            Ok(value) if !value.trim().is_empty() => value,
            _ => return Ok(default_config_path()),
        },
    };
    let expanded = shellexpand::full(&raw)
        .with_context(|| format!("failed to expand config path `{raw}`"))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

impl Config {
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("failed to parse config TOML")
    }

    /// Reads and parses the file, then checks that every account and handler
    /// builds.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
        config
            .build_accounts()
            .with_context(|| format!("invalid config: {}", path.display()))?;
        Ok(config)
    }
}

//! Configuration file handling.
//!
//! This module provides loading and saving of deepscan configuration
//! from a TOML file.
//!
//! # Configuration Location
//!
//! The configuration file is stored at:
//! - Linux: `~/.config/deepscan/config.toml`
//! - macOS: `~/Library/Application Support/deepscan/config.toml`
//! - Windows: `%APPDATA%\deepscan\config.toml`
//!
//! # Example Configuration
//!
//! ```toml
//! cache_ttl_minutes = 60
//! default_format = "table"
//!
//! [advisory]
//! base_url = "https://api.github.com"
//! request_timeout_secs = 60
//! batch_size = 100
//!
//! [auth]
//! base_url = "https://github.com"
//! client_id = "Iv1.0123456789abcdef"
//! scope = "repo"
//!
//! [scan]
//! max_concurrent_projects = 2
//!
//! [breaker]
//! failure_threshold = 5
//! open_cooldown_secs = 20
//! half_open_max_calls = 5
//! idle_reset_secs = 3
//!
//! [ignore]
//! packages = ["@types/*"]
//! advisories = ["GHSA-xxxx-xxxx-xxxx"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::checker::{BreakerSettings, MAX_PACKAGES_PER_QUERY};
use crate::model::Inventory;

/// Application configuration.
///
/// It can be loaded from a TOML file or created with default values.
///
/// # Example
///
/// ```no_run
/// use deepscan::Config;
///
/// // Load from file (or use defaults if file doesn't exist)
/// let config = Config::load().unwrap();
///
/// println!("Projects scanned at once: {}", config.scan.max_concurrent_projects);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Lifetime of cached access tokens that carry no expiry of their own.
    ///
    /// Default: 60 minutes
    pub cache_ttl_minutes: u64,

    /// Default output format when no `--format` flag is provided.
    ///
    /// Valid values: "table", "json"
    /// Default: "table"
    pub default_format: String,

    pub advisory: AdvisoryConfig,

    pub auth: AuthConfig,

    pub scan: ScanConfig,

    pub breaker: BreakerConfig,

    /// Ignore list configuration for suppressing known issues.
    pub ignore: IgnoreConfig,
}

/// Advisory source connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisoryConfig {
    pub base_url: String,

    /// Personal access token. The `GITHUB_TOKEN` environment variable
    /// takes precedence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Client-side timeout of each advisory request, in seconds.
    pub request_timeout_secs: u64,

    /// Packages per advisory query, at most 100.
    pub batch_size: usize,
}

/// OAuth device-flow settings, used when no token is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub base_url: String,
    pub client_id: String,
    pub scope: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Projects resolving advisories at the same time.
    pub max_concurrent_projects: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub open_cooldown_secs: u64,
    pub half_open_max_calls: u32,
    pub idle_reset_secs: u64,
}

/// Configuration for ignoring specific packages or advisories.
///
/// Use this to suppress known false positives or accepted risks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreConfig {
    /// Package names never sent to the advisory source.
    ///
    /// Supports glob patterns (e.g., "lodash*", "@types/*").
    pub packages: Vec<String>,

    /// Advisory IDs to drop from results (e.g., "GHSA-xxxx-xxxx-xxxx").
    ///
    /// Supports glob patterns.
    pub advisories: Vec<String>,
}

impl IgnoreConfig {
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty() && self.advisories.is_empty()
    }

    /// Check if a package should be ignored.
    pub fn should_ignore_package(&self, name: &str) -> bool {
        matches_any(&self.packages, name)
    }

    /// Check if an advisory should be ignored.
    pub fn should_ignore_advisory(&self, advisory_id: &str) -> bool {
        matches_any(&self.advisories, advisory_id)
    }

    /// Copy of `inventory` without ignored packages.
    pub fn filter_inventory(&self, inventory: &Inventory) -> Inventory {
        inventory
            .iter()
            .filter(|(name, _)| !self.should_ignore_package(name))
            .map(|(name, version)| (name.clone(), version.clone()))
            .collect()
    }
}

fn matches_any(patterns: &[String], text: &str) -> bool {
    patterns.iter().any(|pattern| {
        if pattern.contains('*') {
            glob_match(pattern, text)
        } else {
            pattern == text
        }
    })
}

/// Simple glob matching (supports * as wildcard).
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();

    if parts.len() == 1 {
        return pattern == text;
    }

    let mut remaining = text;

    // Check prefix (before first *)
    if !parts[0].is_empty() {
        if !remaining.starts_with(parts[0]) {
            return false;
        }
        remaining = &remaining[parts[0].len()..];
    }

    // Check suffix (after last *)
    let last_part = parts[parts.len() - 1];
    if !last_part.is_empty() {
        if !remaining.ends_with(last_part) {
            return false;
        }
        remaining = &remaining[..remaining.len() - last_part.len()];
    }

    // Check middle parts
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        if let Some(pos) = remaining.find(part) {
            remaining = &remaining[pos + part.len()..];
        } else {
            return false;
        }
    }

    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_ttl_minutes: 60,
            default_format: "table".to_string(),
            advisory: AdvisoryConfig::default(),
            auth: AuthConfig::default(),
            scan: ScanConfig::default(),
            breaker: BreakerConfig::default(),
            ignore: IgnoreConfig::default(),
        }
    }
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            base_url: crate::checker::DEFAULT_ADVISORY_URL.to_string(),
            token: None,
            request_timeout_secs: 60,
            batch_size: MAX_PACKAGES_PER_QUERY,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            base_url: crate::checker::DEFAULT_AUTH_URL.to_string(),
            client_id: String::new(),
            scope: "repo".to_string(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_concurrent_projects: 2,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        let settings = BreakerSettings::default();
        Self {
            failure_threshold: settings.failure_threshold,
            open_cooldown_secs: settings.open_cooldown.as_secs(),
            half_open_max_calls: settings.half_open_max_calls,
            idle_reset_secs: settings.idle_reset.as_secs(),
        }
    }
}

impl BreakerConfig {
    pub fn settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.failure_threshold.max(1),
            open_cooldown: Duration::from_secs(self.open_cooldown_secs),
            half_open_max_calls: self.half_open_max_calls.max(1),
            idle_reset: Duration::from_secs(self.idle_reset_secs),
        }
    }
}

impl Config {
    /// Loads configuration from the config file.
    ///
    /// If the config file doesn't exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Loads configuration from `path`, falling back to defaults when the
    /// file does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Saves the configuration to the config file.
    ///
    /// Creates the parent directory if it doesn't exist.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        Ok(())
    }

    /// Returns the path to the configuration file.
    ///
    /// # Example
    ///
    /// ```
    /// use deepscan::Config;
    ///
    /// let path = Config::config_path();
    /// assert!(path.ends_with("deepscan/config.toml"));
    /// ```
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("deepscan")
            .join("config.toml")
    }

    /// Generates a string containing the default configuration.
    pub fn generate_default_config() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_minutes.saturating_mul(60))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.advisory.request_timeout_secs.max(1))
    }

    /// Token from `GITHUB_TOKEN`, else from the config file.
    pub fn static_token(&self) -> Option<String> {
        std::env::var("GITHUB_TOKEN")
            .ok()
            .or_else(|| self.advisory.token.clone())
            .filter(|token| !token.trim().is_empty())
    }
}

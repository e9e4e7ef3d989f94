//! Configuration loading and data directory resolution
//!
//! Bootstrap settings come from a TOML file; every section has built-in
//! defaults so a missing file is not an error. API keys are never stored in
//! the TOML file, they are read from the environment at the point of use.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "INNPULSA_CONFIG";

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV_VAR: &str = "INNPULSA_DATA_DIR";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TomlConfig {
    /// Root of the data tree (optional, see [`resolve_data_dir`])
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub geocoding: GeocodingConfig,

    #[serde(default)]
    pub sampling: SamplingConfig,

    #[serde(default)]
    pub linkage: LinkageConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, console only if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Text-generation provider settings used by the batch annotator
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub batch_size: usize,
    pub calls_per_second: f64,
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: f64,
    pub timeout_secs: u64,
    pub api_key_env: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".to_string(),
            batch_size: 10,
            // 7.5 requests per minute
            calls_per_second: 0.125,
            max_retries: 5,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            jitter: 0.1,
            timeout_secs: 60,
            api_key_env: "GEMINI_API_KEY".to_string(),
        }
    }
}

/// Map-provider settings used by the geocoders
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GeocodingConfig {
    pub calls_per_second: f64,
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_concurrent: usize,
    /// Completed addresses between checkpoint writes
    pub save_every: usize,
    pub timeout_secs: u64,
    pub api_key_env: String,
    pub nominatim_user_agent: String,
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self {
            calls_per_second: 0.25,
            max_retries: 3,
            initial_delay_ms: 1000,
            max_concurrent: 10,
            save_every: 50,
            timeout_secs: 30,
            api_key_env: "GMAPS_API_KEY".to_string(),
            nominatim_user_agent: format!("innpulsa-geocoder/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Registry pre-filter settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub target_n: usize,
    pub top_k_ciiu: usize,
    pub seed: u64,
    /// Registry observation year whose addresses are normalised
    pub registry_year: i32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            target_n: 520,
            top_k_ciiu: 5,
            seed: 42,
            registry_year: 2023,
        }
    }
}

/// Record linkage settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LinkageConfig {
    /// Correction/reference table (tax-id remaps, city fixes, centres)
    pub corrections: Option<PathBuf>,
    pub top_n_industries: usize,
    /// Ids that denote bad source data rather than real entities
    pub placeholder_ids: Vec<String>,
}

impl Default for LinkageConfig {
    fn default() -> Self {
        Self {
            corrections: None,
            top_n_industries: 5,
            placeholder_ids: vec!["0".to_string(), "1".to_string()],
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TomlConfig {
    /// Parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Read config {} failed: {}", path.display(), e))
        })?;
        let config: TomlConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration following the search order:
    /// 1. Explicit path (command-line argument)
    /// 2. `INNPULSA_CONFIG` environment variable
    /// 3. `~/.config/innpulsa/config.toml`
    /// 4. Built-in defaults
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = cli_path {
            info!("Loading config from {}", path.display());
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let path = PathBuf::from(path);
            info!("Loading config from {} ({})", path.display(), CONFIG_ENV_VAR);
            return Self::from_file(&path);
        }

        if let Some(path) = default_config_path() {
            if path.exists() {
                info!("Loading config from {}", path.display());
                return Self::from_file(&path);
            }
        }

        debug!("No config file found, using built-in defaults");
        Ok(Self::default())
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.llm.batch_size == 0 {
            return Err(Error::Config("llm.batch_size must be > 0".to_string()));
        }
        if !(self.llm.calls_per_second > 0.0) || !(self.geocoding.calls_per_second > 0.0) {
            return Err(Error::Config("calls_per_second must be > 0".to_string()));
        }
        if self.geocoding.max_concurrent == 0 {
            return Err(Error::Config(
                "geocoding.max_concurrent must be > 0".to_string(),
            ));
        }
        if self.geocoding.save_every == 0 {
            return Err(Error::Config("geocoding.save_every must be > 0".to_string()));
        }
        Ok(())
    }
}

/// `~/.config/innpulsa/config.toml` on platforms that have a config dir
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("innpulsa").join("config.toml"))
}

/// Data directory resolution priority:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. `./data` fallback
pub fn resolve_data_dir(cli_arg: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(DATA_DIR_ENV_VAR) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &config.data_dir {
        return path.clone();
    }

    PathBuf::from("data")
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

/// Read an API key from the environment
///
/// Returns `None` (and logs an actionable error) when the variable is unset
/// or blank.
pub fn api_key_from_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(key) if is_valid_key(&key) => Some(key),
        Ok(_) => {
            warn!("{} is set but empty", var_name);
            tracing::error!("{} environment variable is required", var_name);
            None
        }
        Err(_) => {
            tracing::error!("{} environment variable is required", var_name);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = TomlConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.llm.batch_size, 10);
        assert_eq!(config.geocoding.save_every, 50);
        assert_eq!(config.linkage.placeholder_ids, vec!["0", "1"]);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            "data_dir = \"/srv/innpulsa\"\n[llm]\nbatch_size = 25\n",
        )
        .unwrap();

        let config = TomlConfig::from_file(&path).unwrap();
        assert_eq!(config.data_dir, Some(PathBuf::from("/srv/innpulsa")));
        assert_eq!(config.llm.batch_size, 25);
        assert_eq!(config.llm.max_retries, 5);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_zero_rate_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[geocoding]\ncalls_per_second = 0.0\n").unwrap();

        assert!(matches!(TomlConfig::from_file(&path), Err(Error::Config(_))));
    }

    #[test]
    #[serial]
    fn test_data_dir_priority() {
        let config = TomlConfig {
            data_dir: Some(PathBuf::from("/from/toml")),
            ..Default::default()
        };

        std::env::set_var(DATA_DIR_ENV_VAR, "/from/env");
        assert_eq!(
            resolve_data_dir(Some(Path::new("/from/cli")), &config),
            PathBuf::from("/from/cli")
        );
        assert_eq!(resolve_data_dir(None, &config), PathBuf::from("/from/env"));

        std::env::remove_var(DATA_DIR_ENV_VAR);
        assert_eq!(resolve_data_dir(None, &config), PathBuf::from("/from/toml"));
        assert_eq!(
            resolve_data_dir(None, &TomlConfig::default()),
            PathBuf::from("data")
        );
    }

    #[test]
    #[serial]
    fn test_api_key_from_env() {
        std::env::set_var("INNPULSA_TEST_KEY", "abc123");
        assert_eq!(api_key_from_env("INNPULSA_TEST_KEY"), Some("abc123".to_string()));

        std::env::set_var("INNPULSA_TEST_KEY", "   ");
        assert_eq!(api_key_from_env("INNPULSA_TEST_KEY"), None);

        std::env::remove_var("INNPULSA_TEST_KEY");
        assert_eq!(api_key_from_env("INNPULSA_TEST_KEY"), None);
    }
}

//! Application configuration for TenderFlow.
//!
//! User config lives at `~/.tenderflow/tenderflow.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TenderFlowError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "tenderflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".tenderflow";

// ---------------------------------------------------------------------------
// Config structs (matching tenderflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Generation oracle settings.
    #[serde(default)]
    pub oracle: OracleConfig,

    /// Matching settings.
    #[serde(default)]
    pub matching: MatchingConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory holding the database, index files, and proposals.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Margin percentage applied on top of the base total.
    #[serde(default = "default_margin_percent")]
    pub margin_percent: f64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            margin_percent: default_margin_percent(),
        }
    }
}

fn default_data_dir() -> String {
    "var/tenderflow".into()
}
fn default_margin_percent() -> f64 {
    10.0
}

/// `[oracle]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Base URL of the generation endpoint.
    #[serde(default = "default_oracle_base_url")]
    pub base_url: String,

    /// Model name passed to the endpoint.
    #[serde(default = "default_oracle_model")]
    pub model: String,

    /// Request timeout for requirement extraction, in seconds.
    #[serde(default = "default_extract_timeout")]
    pub timeout_secs: u64,

    /// Request timeout for tender summarization, in seconds.
    #[serde(default = "default_summary_timeout")]
    pub summary_timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: default_oracle_base_url(),
            model: default_oracle_model(),
            timeout_secs: default_extract_timeout(),
            summary_timeout_secs: default_summary_timeout(),
        }
    }
}

fn default_oracle_base_url() -> String {
    "http://localhost:11434".into()
}
fn default_oracle_model() -> String {
    "phi3:mini".into()
}
fn default_extract_timeout() -> u64 {
    120
}
fn default_summary_timeout() -> u64 {
    180
}

/// `[matching]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Neighbors retrieved per requirement. Kept small so every candidate
    /// stays explainable in the proposal.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    3
}

// ---------------------------------------------------------------------------
// Pipeline config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory holding the database, index files, and proposals.
    pub data_dir: PathBuf,
    /// Neighbors retrieved per requirement.
    pub top_k: usize,
    /// Margin percentage applied by the pricing stage.
    pub margin_percent: f64,
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            data_dir: PathBuf::from(&config.defaults.data_dir),
            top_k: config.matching.top_k,
            margin_percent: config.defaults.margin_percent,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.tenderflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| TenderFlowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.tenderflow/tenderflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| TenderFlowError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        TenderFlowError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| TenderFlowError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| TenderFlowError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| TenderFlowError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the oracle base URL parses and that tunables are sane.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    url::Url::parse(&config.oracle.base_url).map_err(|e| {
        TenderFlowError::config(format!(
            "oracle base_url '{}' is not a valid URL: {e}",
            config.oracle.base_url
        ))
    })?;

    if config.matching.top_k == 0 {
        return Err(TenderFlowError::config("matching top_k must be at least 1"));
    }
    if config.defaults.margin_percent < 0.0 {
        return Err(TenderFlowError::config(
            "defaults margin_percent must not be negative",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("phi3:mini"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.matching.top_k, 3);
        assert_eq!(parsed.defaults.margin_percent, 10.0);
        assert_eq!(parsed.oracle.timeout_secs, 120);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[oracle]
base_url = "http://oracle.internal:11434"
model = "phi3:medium"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.oracle.base_url, "http://oracle.internal:11434");
        assert_eq!(config.oracle.model, "phi3:medium");
        assert_eq!(config.oracle.timeout_secs, 120);
        assert_eq!(config.defaults.data_dir, "var/tenderflow");
    }

    #[test]
    fn pipeline_config_from_app_config() {
        let app = AppConfig::default();
        let pipeline = PipelineConfig::from(&app);
        assert_eq!(pipeline.top_k, 3);
        assert_eq!(pipeline.margin_percent, 10.0);
        assert_eq!(pipeline.data_dir, PathBuf::from("var/tenderflow"));
    }

    #[test]
    fn config_validation() {
        let mut config = AppConfig::default();
        assert!(validate_config(&config).is_ok());

        config.oracle.base_url = "not a url".into();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("not a valid URL"));

        config.oracle.base_url = default_oracle_base_url();
        config.matching.top_k = 0;
        assert!(validate_config(&config).is_err());
    }
}

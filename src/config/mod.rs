use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

pub mod defaults;
pub mod duration_serde;

use crate::errors::{ScaleError, ScaleResult};
use crate::models::{Direction, ScaleDefaults};
use defaults::*;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scaling: ScalingConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory of the sandboxed blob store
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    /// Image field whose scales are managed; namespaces all keys
    #[serde(default = "default_field")]
    pub field: String,
}

/// Values used when a scale request omits them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    #[serde(default = "default_direction")]
    pub default_direction: Direction,
    #[serde(default = "default_quality")]
    pub default_quality: u8,
    /// Requests whose output would exceed this many pixels are rejected
    #[serde(default = "default_max_output_pixels")]
    pub max_output_pixels: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Scales older than this are removed by `purge`
    /// Can be specified as seconds (number) or human-readable string (e.g., "30days", "12h")
    #[serde(default = "default_max_age", with = "duration_serde::duration")]
    pub max_age: Duration,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(DEFAULT_STORAGE_PATH)
}

fn default_field() -> String {
    DEFAULT_FIELD.to_string()
}

fn default_direction() -> Direction {
    DEFAULT_DIRECTION
}

fn default_quality() -> u8 {
    DEFAULT_QUALITY
}

fn default_max_output_pixels() -> u64 {
    DEFAULT_MAX_OUTPUT_PIXELS
}

fn default_max_age() -> Duration {
    humantime::parse_duration(DEFAULT_MAX_AGE).unwrap_or(Duration::from_secs(30 * 24 * 60 * 60))
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            field: default_field(),
        }
    }
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            default_direction: default_direction(),
            default_quality: default_quality(),
            max_output_pixels: default_max_output_pixels(),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            max_age: default_max_age(),
        }
    }
}

impl From<&ScalingConfig> for ScaleDefaults {
    fn from(config: &ScalingConfig) -> Self {
        Self {
            direction: config.default_direction,
            quality: config.default_quality,
        }
    }
}

impl Config {
    /// Load configuration, writing a default file if none exists yet
    pub fn load_from_file(config_file: &str) -> Result<Self> {
        let config = if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(config_file)?;
            toml::from_str::<Self>(&contents)?
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(config_file, contents)?;
            info!("Created default config file: {}", config_file);
            default_config
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ScaleResult<()> {
        if self.storage.field.trim().is_empty() {
            return Err(ScaleError::configuration("storage.field must not be empty"));
        }
        if !(1..=100).contains(&self.scaling.default_quality) {
            return Err(ScaleError::configuration(format!(
                "scaling.default_quality must be between 1 and 100, got {}",
                self.scaling.default_quality
            )));
        }
        if self.scaling.max_output_pixels == 0 {
            return Err(ScaleError::configuration(
                "scaling.max_output_pixels must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn scale_defaults(&self) -> ScaleDefaults {
        ScaleDefaults::from(&self.scaling)
    }
}

//! YAML configuration aggregating the decoder, correlator, event builder and
//! readout settings.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::correlator::CorrelatorConfig;
use crate::decoder::DecoderConfig;
use crate::event_builder::BuilderConfig;
use crate::readout::ReadoutOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Structure representing the readout configuration.
/// Configs are serializable and deserializable to YAML using serde and serde_yaml.
/// Every section is optional in the file and falls back to its defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub decoder: DecoderConfig,
    pub correlator: CorrelatorConfig,
    pub builder: BuilderConfig,
    pub readout: ReadoutOptions,
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a validated Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;
        let config = serde_yaml::from_str::<Self>(&yaml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    /// Check every section for values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.decoder.validate()?;
        self.correlator.validate()?;
        self.builder.validate()?;
        if let Some(online) = &self.readout.online_decoding {
            online.validate()?;
        }
        self.readout.validate()
    }
}

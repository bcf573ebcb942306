use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::constants::{DEFAULT_GANTRY_TOLERANCE, DEFAULT_GRID_RESOLUTION};
use super::error::ConfigError;
use super::machine::{MachineDescriptor, MachineKind};

/// Structure representing the application configuration. Contains pathing and calculation
/// information.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// TRF (.trf) or RT plan (.dcm) files to process
    pub input_paths: Vec<PathBuf>,
    /// Directory receiving one archive per input
    pub output_path: PathBuf,
    /// Machine geometry. When null it is inferred from each input.
    pub machine: Option<MachineKind>,
    pub grid_resolution: f64,
    /// Restrict each delivery to the control points recorded near this gantry angle
    pub gantry_angle: Option<f64>,
    pub gantry_tolerance: f64,
    /// Fraction group of RT plan inputs. May be null for plans with one fraction group.
    pub fraction_group: Option<i32>,
    pub n_threads: usize,
}

impl Default for Config {
    /// Generate a new Config object. Paths will be empty/invalid
    fn default() -> Self {
        Self {
            input_paths: Vec::new(),
            output_path: PathBuf::from("None"),
            machine: None,
            grid_resolution: DEFAULT_GRID_RESOLUTION,
            gantry_angle: None,
            gantry_tolerance: DEFAULT_GANTRY_TOLERANCE,
            fraction_group: None,
            n_threads: 1,
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    /// The configured machine, if any
    pub fn machine_descriptor(&self) -> Result<Option<MachineDescriptor>, ConfigError> {
        match &self.machine {
            Some(kind) => Ok(Some(kind.descriptor()?)),
            None => Ok(None),
        }
    }

    /// Get the path of the archive for an input; the extension is set by the writer
    pub fn get_archive_path(&self, input_path: &Path) -> Result<PathBuf, ConfigError> {
        if !self.output_path.exists() {
            return Err(ConfigError::BadFilePath(self.output_path.clone()));
        }
        let stem = input_path
            .file_stem()
            .ok_or_else(|| ConfigError::BadFilePath(input_path.to_path_buf()))?;
        Ok(self.output_path.join(stem))
    }

    pub fn is_n_threads_valid(&self) -> bool {
        self.n_threads >= 1
    }
}

use crate::source::ObservationLayout;
use crate::types::{DataColumn, ImagingMode, SpectralWindow};
use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write pass configuration: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML pass configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize pass configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid pass configuration: {0}")]
    Invalid(String),
}

/// Everything needed to run one gridding pass. Missing fields take the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PassConfig {
    pub mode: ImagingMode,
    /// Data column to grid. When absent the mode picks one.
    pub column: Option<DataColumn>,
    /// Stage kernels on a separate thread, overlapped with gridding.
    pub overlap: bool,
    pub is_root: bool,
    pub grid_size: usize,
    /// Grid cell size in wavelengths.
    pub cell_lambda: f64,
    /// Kernel half-width in grid cells.
    pub support: usize,
    /// One kernel set serves every spectral window (A-only / W-only projection).
    pub single_kernel_set: bool,
    pub windows: Vec<SpectralWindow>,
    pub observation: ObservationLayout,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            mode: ImagingMode::Residual,
            column: None,
            overlap: true,
            is_root: true,
            grid_size: 256,
            cell_lambda: 2.0,
            support: 3,
            single_kernel_set: false,
            windows: vec![
                SpectralWindow {
                    id: 0,
                    ref_freq_hz: 1.4e9,
                },
                SpectralWindow {
                    id: 1,
                    ref_freq_hz: 1.5e9,
                },
            ],
            observation: ObservationLayout::default(),
        }
    }
}

impl PassConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: PassConfig = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.windows.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one spectral window must be selected".to_string(),
            ));
        }
        let mut ids = AHashSet::with_capacity(self.windows.len());
        for window in &self.windows {
            if !ids.insert(window.id) {
                return Err(ConfigError::Invalid(format!(
                    "spectral window {} is listed more than once",
                    window.id
                )));
            }
            if !(window.ref_freq_hz > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "spectral window {} has a non-positive reference frequency",
                    window.id
                )));
            }
        }
        if !(self.cell_lambda > 0.0) {
            return Err(ConfigError::Invalid(
                "cell_lambda must be positive".to_string(),
            ));
        }
        if self.grid_size < 2 * self.support + 2 {
            return Err(ConfigError::Invalid(format!(
                "grid_size {} is too small for a kernel of support {}",
                self.grid_size, self.support
            )));
        }
        if self.observation.rows_per_row_buffer == 0 {
            return Err(ConfigError::Invalid(
                "observation.rows_per_row_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

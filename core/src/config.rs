//! Tracker configuration
//!
//! Configuration is split in three groups that are fixed for the lifetime of a [crate::Tracker]:
//! - [ProcessNoise]: tunable hyperparameters of the CTRV process model.
//! - [SensorNoise]: measurement noise standard deviations provided by the sensor manufacturer.
//!   These are kept apart from the tunables so that tuning never touches them.
//! - [SensorSelection]: which sensors are allowed to initialize and update the filter.
//!
//! [TrackerConfig] aggregates the three and can be read from or written to JSON, YAML or TOML.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::FilterError;

/// Process noise standard deviations of the CTRV model
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessNoise {
    /// Longitudinal acceleration noise in m/s^2
    pub std_a: f64,
    /// Yaw acceleration noise in rad/s^2
    pub std_yawdd: f64,
}
impl Default for ProcessNoise {
    fn default() -> Self {
        ProcessNoise {
            std_a: 3.0,
            std_yawdd: 6.0,
        }
    }
}
impl ProcessNoise {
    pub fn validate(&self) -> Result<(), FilterError> {
        for (name, value) in [("std_a", self.std_a), ("std_yawdd", self.std_yawdd)] {
            if !value.is_finite() || value < 0.0 {
                return Err(FilterError::InvalidConfiguration {
                    description: format!(
                        "process noise {} must be finite and non-negative, got {}",
                        name, value
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Measurement noise standard deviations. Do not tune; these come from the sensor datasheet.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorNoise {
    /// Lidar x position in m
    pub std_position_x: f64,
    /// Lidar y position in m
    pub std_position_y: f64,
    /// Radar range in m
    pub std_range: f64,
    /// Radar bearing in rad
    pub std_bearing: f64,
    /// Radar range rate in m/s
    pub std_range_rate: f64,
}
impl Default for SensorNoise {
    fn default() -> Self {
        SensorNoise {
            std_position_x: 0.15,
            std_position_y: 0.15,
            std_range: 0.3,
            std_bearing: 0.03,
            std_range_rate: 0.3,
        }
    }
}
impl SensorNoise {
    /// Every standard deviation must be strictly positive, which keeps the innovation covariance
    /// positive definite.
    pub fn validate(&self) -> Result<(), FilterError> {
        let fields = [
            ("std_position_x", self.std_position_x),
            ("std_position_y", self.std_position_y),
            ("std_range", self.std_range),
            ("std_bearing", self.std_bearing),
            ("std_range_rate", self.std_range_rate),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value <= 0.0 {
                return Err(FilterError::InvalidConfiguration {
                    description: format!(
                        "sensor noise {} must be finite and strictly positive, got {}",
                        name, value
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Sensor enable flags. A disabled sensor neither initializes nor updates the filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSelection {
    pub use_position_sensor: bool,
    pub use_range_bearing_sensor: bool,
}
impl Default for SensorSelection {
    fn default() -> Self {
        SensorSelection {
            use_position_sensor: true,
            use_range_bearing_sensor: true,
        }
    }
}

/// Complete construction-time configuration of a tracker
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub sensors: SensorSelection,
    #[serde(default)]
    pub process_noise: ProcessNoise,
    #[serde(default)]
    pub sensor_noise: SensorNoise,
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), FilterError> {
        self.process_noise.validate()?;
        self.sensor_noise.validate()
    }

    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }

    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }
    /// Write the configuration as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }

    /// Read the configuration from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }
    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }
    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match ConfigFormat::from_path(p)? {
            ConfigFormat::Json => self.to_json(p),
            ConfigFormat::Yaml => self.to_yaml(p),
            ConfigFormat::Toml => self.to_toml(p),
        }
    }
    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match ConfigFormat::from_path(p)? {
            ConfigFormat::Json => Self::from_json(p),
            ConfigFormat::Yaml => Self::from_yaml(p),
            ConfigFormat::Toml => Self::from_toml(p),
        }
    }
}

/// Serialization format of a configuration file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}
impl ConfigFormat {
    /// Format implied by the file extension, case-insensitive
    pub fn from_path(p: &Path) -> io::Result<ConfigFormat> {
        let ext = p
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());
        match ext.as_deref() {
            Some("json") => Ok(ConfigFormat::Json),
            Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
            Some("toml") => Ok(ConfigFormat::Toml),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "unsupported configuration file extension {:?} for {}",
                    other.unwrap_or(""),
                    p.display()
                ),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TrackerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.sensors.use_position_sensor);
        assert!(config.sensors.use_range_bearing_sensor);
        assert_eq!(config.sensor_noise.std_bearing, 0.03);
    }

    #[test]
    fn zero_sensor_noise_is_rejected() {
        let config = TrackerConfig {
            sensor_noise: SensorNoise {
                std_range: 0.0,
                ..SensorNoise::default()
            },
            ..TrackerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("std_range"));
    }

    #[test]
    fn negative_process_noise_is_rejected() {
        let noise = ProcessNoise {
            std_a: -1.0,
            std_yawdd: 0.5,
        };
        assert!(noise.validate().is_err());
        let noise = ProcessNoise {
            std_a: 0.0,
            std_yawdd: f64::NAN,
        };
        assert!(noise.validate().is_err());
        let noise = ProcessNoise {
            std_a: 0.0,
            std_yawdd: 0.0,
        };
        assert!(noise.validate().is_ok());
    }

    #[test]
    fn partial_file_uses_defaults() {
        let config: TrackerConfig =
            toml::from_str("[process_noise]\nstd_a = 0.5\nstd_yawdd = 0.4\n").unwrap();
        assert_eq!(config.process_noise.std_a, 0.5);
        assert_eq!(config.sensor_noise, SensorNoise::default());
        assert_eq!(config.sensors, SensorSelection::default());
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(
            ConfigFormat::from_path(Path::new("a/b.JSON")).unwrap(),
            ConfigFormat::Json
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("tracker.yml")).unwrap(),
            ConfigFormat::Yaml
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("tracker.toml")).unwrap(),
            ConfigFormat::Toml
        );
        assert!(ConfigFormat::from_path(Path::new("tracker")).is_err());
    }

    #[test]
    fn unsupported_extension() {
        let err = TrackerConfig::from_file("config.ini").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}

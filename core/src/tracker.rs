//! Filter controller
//!
//! The [Tracker] owns the unscented Kalman filter and decides, per incoming
//! [MeasurementPackage], whether to seed the filter or run a predict/update cycle. It moves
//! one way from uninitialized to initialized and is not reentrant: packets must be handed to it
//! one at a time, in non-decreasing timestamp order.

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};

use crate::config::TrackerConfig;
use crate::error::FilterError;
use crate::kalman::{FilterState, UnscentedKalmanFilter};
use crate::measurements::{MeasurementPackage, SensorType};
use crate::TrackingFilter;

/// What a successfully processed packet did to the filter
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ProcessOutcome {
    /// The packet seeded the filter; no prediction or update ran
    Initialized,
    /// The filter was predicted forward by `dt` seconds but the packet's sensor is disabled
    Predicted { dt: f64 },
    /// The filter was predicted forward by `dt` seconds and corrected with the packet
    Updated { dt: f64, nis: f64 },
}
impl ProcessOutcome {
    pub fn nis(&self) -> Option<f64> {
        match self {
            ProcessOutcome::Updated { nis, .. } => Some(*nis),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
enum Lifecycle {
    Uninitialized,
    Initialized {
        filter: UnscentedKalmanFilter,
        /// Timestamp of the last accepted packet (microseconds)
        timestamp: u64,
    },
}

/// Single-target lidar/radar fusion controller
#[derive(Clone, Debug)]
pub struct Tracker {
    config: TrackerConfig,
    lifecycle: Lifecycle,
}

impl Tracker {
    /// Create an uninitialized tracker. Fails if any noise parameter is invalid.
    pub fn new(config: TrackerConfig) -> Result<Tracker, FilterError> {
        config.validate()?;
        Ok(Tracker {
            config,
            lifecycle: Lifecycle::Uninitialized,
        })
    }
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }
    pub fn is_initialized(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Initialized { .. })
    }
    /// Current belief, `None` until the first accepted packet
    pub fn state(&self) -> Option<&FilterState> {
        match &self.lifecycle {
            Lifecycle::Initialized { filter, .. } => Some(filter.get_state()),
            Lifecycle::Uninitialized => None,
        }
    }
    pub fn estimate(&self) -> Option<DVector<f64>> {
        self.state().map(|s| s.mean.clone())
    }
    pub fn covariance(&self) -> Option<DMatrix<f64>> {
        self.state().map(|s| s.covariance.clone())
    }
    /// Timestamp of the last accepted packet
    pub fn timestamp(&self) -> Option<u64> {
        match &self.lifecycle {
            Lifecycle::Initialized { timestamp, .. } => Some(*timestamp),
            Lifecycle::Uninitialized => None,
        }
    }
    pub fn is_sensor_enabled(&self, sensor: SensorType) -> bool {
        match sensor {
            SensorType::Lidar => self.config.sensors.use_position_sensor,
            SensorType::Radar => self.config.sensors.use_range_bearing_sensor,
        }
    }

    /// Process one packet.
    ///
    /// - Uninitialized: an enabled sensor seeds the state from the measured position with zero
    ///   speed, heading and heading rate and identity covariance. A disabled sensor yields
    ///   [FilterError::InitializationFailed] and the tracker stays uninitialized.
    /// - Initialized: the filter is predicted to the packet's timestamp and, if the sensor is
    ///   enabled, corrected with the packet.
    ///
    /// On any error the tracker is left exactly as it was before the call.
    pub fn process_measurement(
        &mut self,
        package: &MeasurementPackage,
    ) -> Result<ProcessOutcome, FilterError> {
        package.validate()?;
        let enabled = self.is_sensor_enabled(package.sensor_type);
        match &mut self.lifecycle {
            Lifecycle::Uninitialized => {
                if !enabled {
                    warn!(
                        "cannot initialize from {} packet at {} us: sensor disabled",
                        package.sensor_type, package.timestamp
                    );
                    return Err(FilterError::InitializationFailed {
                        sensor: package.sensor_type,
                    });
                }
                let (px, py) = package.initial_position();
                let filter = UnscentedKalmanFilter::new(
                    FilterState::from_position(px, py),
                    self.config.process_noise,
                );
                info!(
                    "initialized from {} at {} us: px {:.4}, py {:.4}",
                    package.sensor_type, package.timestamp, px, py
                );
                self.lifecycle = Lifecycle::Initialized {
                    filter,
                    timestamp: package.timestamp,
                };
                Ok(ProcessOutcome::Initialized)
            }
            Lifecycle::Initialized { filter, timestamp } => {
                if package.timestamp < *timestamp {
                    return Err(FilterError::TimestampRegression {
                        previous: *timestamp,
                        current: package.timestamp,
                    });
                }
                let dt = (package.timestamp - *timestamp) as f64 / 1e6;
                let mut next = filter.clone();
                next.predict(dt)?;
                let outcome = if enabled {
                    let measurement = package.to_measurement(&self.config.sensor_noise);
                    let nis = next.update(measurement.as_ref())?;
                    debug!(
                        "{} update at {} us: dt {:.6} s, nis {:.4}",
                        package.sensor_type, package.timestamp, dt, nis
                    );
                    ProcessOutcome::Updated { dt, nis }
                } else {
                    debug!(
                        "{} sensor disabled, prediction only at {} us: dt {:.6} s",
                        package.sensor_type, package.timestamp, dt
                    );
                    ProcessOutcome::Predicted { dt }
                };
                *filter = next;
                *timestamp = package.timestamp;
                Ok(outcome)
            }
        }
    }
}

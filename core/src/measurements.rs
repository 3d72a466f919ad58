//! Measurement-related code for the tracking filter.
//!
//! This module defines the raw measurement packet delivered by the feed and the generic
//! measurement model used by the unscented update, along with the two sensor implementations:
//! a lidar that observes Cartesian position directly and a radar that observes range, bearing
//! and range rate.

use std::fmt::{self, Debug, Display};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::config::SensorNoise;
use crate::error::FilterError;
use crate::wrap_to_pi;

/// Smallest range used as a divisor in the radar range-rate projection
pub const MIN_RANGE: f64 = 1e-4;

/// Sensor that produced a measurement packet
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorType {
    /// Position-only sensor reporting `[x, y]`
    #[serde(rename = "L", alias = "lidar", alias = "LIDAR")]
    Lidar,
    /// Range/bearing/range-rate sensor reporting `[range, bearing, range_rate]`
    #[serde(rename = "R", alias = "radar", alias = "RADAR")]
    Radar,
}
impl SensorType {
    /// Number of raw values this sensor reports
    pub fn dimension(&self) -> usize {
        match self {
            SensorType::Lidar => 2,
            SensorType::Radar => 3,
        }
    }
}
impl Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorType::Lidar => write!(f, "lidar"),
            SensorType::Radar => write!(f, "radar"),
        }
    }
}

/// A single time-stamped packet from the measurement feed
#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementPackage {
    /// Microseconds, non-decreasing across the feed
    pub timestamp: u64,
    pub sensor_type: SensorType,
    /// `[x, y]` for lidar, `[range, bearing, range_rate]` for radar
    pub raw_measurements: DVector<f64>,
}
impl MeasurementPackage {
    pub fn lidar(timestamp: u64, px: f64, py: f64) -> Self {
        MeasurementPackage {
            timestamp,
            sensor_type: SensorType::Lidar,
            raw_measurements: DVector::from_vec(vec![px, py]),
        }
    }
    pub fn radar(timestamp: u64, range: f64, bearing: f64, range_rate: f64) -> Self {
        MeasurementPackage {
            timestamp,
            sensor_type: SensorType::Radar,
            raw_measurements: DVector::from_vec(vec![range, bearing, range_rate]),
        }
    }
    /// Check that the packet carries exactly as many values as its sensor reports
    pub fn validate(&self) -> Result<(), FilterError> {
        let expected = self.sensor_type.dimension();
        if self.raw_measurements.len() != expected {
            return Err(FilterError::MalformedPacket {
                sensor: self.sensor_type,
                expected,
                actual: self.raw_measurements.len(),
            });
        }
        Ok(())
    }
    /// Cartesian position implied by the packet, used to seed the filter
    pub fn initial_position(&self) -> (f64, f64) {
        let z = &self.raw_measurements;
        match self.sensor_type {
            SensorType::Lidar => (z[0], z[1]),
            SensorType::Radar => (z[0] * z[1].cos(), z[0] * z[1].sin()),
        }
    }
    /// Wrap the packet values into the measurement model of its sensor
    pub fn to_measurement(&self, noise: &SensorNoise) -> Box<dyn MeasurementModel> {
        let z = &self.raw_measurements;
        match self.sensor_type {
            SensorType::Lidar => Box::new(LidarMeasurement {
                px: z[0],
                py: z[1],
                std_px: noise.std_position_x,
                std_py: noise.std_position_y,
            }),
            SensorType::Radar => Box::new(RadarMeasurement {
                range: z[0],
                bearing: z[1],
                range_rate: z[2],
                std_range: noise.std_range,
                std_bearing: noise.std_bearing,
                std_range_rate: noise.std_range_rate,
            }),
        }
    }
}

/// Generic measurement model trait for all types of measurements
pub trait MeasurementModel: Debug {
    /// Sensor this model describes
    fn get_sensor_type(&self) -> SensorType;
    /// Get the dimension of the measurement vector
    fn get_dimension(&self) -> usize;
    /// Get the measurement in a vector format
    fn get_vector(&self) -> DVector<f64>;
    /// Get the measurement noise covariance
    fn get_noise(&self) -> DMatrix<f64>;
    /// Map a state vector into measurement space
    fn get_expected_measurement(&self, state: &DVector<f64>) -> DVector<f64>;
    /// Difference `a - b` of two measurement-space vectors. Models with angular components
    /// override this to keep those components wrapped to (-π, π].
    fn get_residual(&self, a: &DVector<f64>, b: &DVector<f64>) -> DVector<f64> {
        a - b
    }
    /// Project every state sigma point (one per column) into measurement space
    fn get_sigma_points(&self, state_sigma_points: &DMatrix<f64>) -> DMatrix<f64> {
        let mut measurement_sigma_points =
            DMatrix::<f64>::zeros(self.get_dimension(), state_sigma_points.ncols());
        for (i, sigma_point) in state_sigma_points.column_iter().enumerate() {
            let z = self.get_expected_measurement(&sigma_point.clone_owned());
            measurement_sigma_points.set_column(i, &z);
        }
        measurement_sigma_points
    }
}

/// Lidar position measurement model
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LidarMeasurement {
    pub px: f64,
    pub py: f64,
    pub std_px: f64,
    pub std_py: f64,
}
impl Display for LidarMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LidarMeasurement(px: {}, py: {}, std_px: {}, std_py: {})",
            self.px, self.py, self.std_px, self.std_py
        )
    }
}
impl MeasurementModel for LidarMeasurement {
    fn get_sensor_type(&self) -> SensorType {
        SensorType::Lidar
    }
    fn get_dimension(&self) -> usize {
        2
    }
    fn get_vector(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.px, self.py])
    }
    fn get_noise(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_vec(vec![
            self.std_px.powi(2),
            self.std_py.powi(2),
        ]))
    }
    fn get_expected_measurement(&self, state: &DVector<f64>) -> DVector<f64> {
        DVector::from_vec(vec![state[0], state[1]])
    }
}

/// Radar range / bearing / range-rate measurement model
///
/// The expected measurement of a state `[px, py, v, yaw, yaw_rate]` is
///
/// $$
/// \rho = \sqrt{p_x^2 + p_y^2}, \quad
/// \varphi = \operatorname{atan2}(p_y, p_x), \quad
/// \dot\rho = \frac{p_x v \cos\psi + p_y v \sin\psi}{\max(\rho, \rho_{min})}
/// $$
///
/// The bearing component of every residual is wrapped to (-π, π].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RadarMeasurement {
    pub range: f64,
    pub bearing: f64,
    pub range_rate: f64,
    pub std_range: f64,
    pub std_bearing: f64,
    pub std_range_rate: f64,
}
impl Display for RadarMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RadarMeasurement(range: {}, bearing: {}, range_rate: {}, std: [{}, {}, {}])",
            self.range,
            self.bearing,
            self.range_rate,
            self.std_range,
            self.std_bearing,
            self.std_range_rate
        )
    }
}
impl MeasurementModel for RadarMeasurement {
    fn get_sensor_type(&self) -> SensorType {
        SensorType::Radar
    }
    fn get_dimension(&self) -> usize {
        3
    }
    fn get_vector(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.range, self.bearing, self.range_rate])
    }
    fn get_noise(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_vec(vec![
            self.std_range.powi(2),
            self.std_bearing.powi(2),
            self.std_range_rate.powi(2),
        ]))
    }
    fn get_expected_measurement(&self, state: &DVector<f64>) -> DVector<f64> {
        let (px, py, v, yaw) = (state[0], state[1], state[2], state[3]);
        let range = px.hypot(py);
        let bearing = py.atan2(px);
        let range_rate = (px * v * yaw.cos() + py * v * yaw.sin()) / range.max(MIN_RANGE);
        DVector::from_vec(vec![range, bearing, range_rate])
    }
    fn get_residual(&self, a: &DVector<f64>, b: &DVector<f64>) -> DVector<f64> {
        let mut residual = a - b;
        residual[1] = wrap_to_pi(residual[1]);
        residual
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    fn radar() -> RadarMeasurement {
        RadarMeasurement {
            range: 1.0,
            bearing: 0.0,
            range_rate: 0.0,
            std_range: 0.3,
            std_bearing: 0.03,
            std_range_rate: 0.3,
        }
    }

    #[test]
    fn lidar_projects_position() {
        let meas = LidarMeasurement {
            px: 1.0,
            py: 2.0,
            std_px: 0.15,
            std_py: 0.15,
        };
        let state = DVector::from_vec(vec![3.0, 4.0, 5.0, 0.3, 0.1]);
        let z = meas.get_expected_measurement(&state);
        assert_eq!(z.len(), 2);
        assert_eq!(z[0], 3.0);
        assert_eq!(z[1], 4.0);
        let noise = meas.get_noise();
        assert_approx_eq!(noise[(0, 0)], 0.0225, 1e-12);
        assert_approx_eq!(noise[(1, 1)], 0.0225, 1e-12);
        assert_eq!(noise[(0, 1)], 0.0);
    }

    #[test]
    fn lidar_residual_is_not_wrapped() {
        let meas = LidarMeasurement::default();
        let a = DVector::from_vec(vec![0.0, 4.0]);
        let b = DVector::from_vec(vec![0.0, -4.0]);
        assert_eq!(meas.get_residual(&a, &b)[1], 8.0);
    }

    #[test]
    fn radar_projects_polar() {
        let meas = radar();
        let state = DVector::from_vec(vec![3.0, 4.0, 2.0, (4.0f64).atan2(3.0), 0.0]);
        let z = meas.get_expected_measurement(&state);
        assert_approx_eq!(z[0], 5.0, 1e-12);
        assert_approx_eq!(z[1], (4.0f64).atan2(3.0), 1e-12);
        // moving straight away from the origin at 2 m/s
        assert_approx_eq!(z[2], 2.0, 1e-12);
    }

    #[test]
    fn radar_origin_is_finite() {
        let meas = radar();
        let state = DVector::from_vec(vec![0.0, 0.0, 5.0, 0.7, 0.0]);
        let z = meas.get_expected_measurement(&state);
        assert!(z.iter().all(|v| v.is_finite()));
        assert_eq!(z[0], 0.0);
        assert_eq!(z[2], 0.0);
    }

    #[test]
    fn radar_residual_wraps_bearing() {
        let meas = radar();
        let a = DVector::from_vec(vec![1.0, PI - 0.1, 0.0]);
        let b = DVector::from_vec(vec![1.0, -PI + 0.1, 0.0]);
        let residual = meas.get_residual(&a, &b);
        assert_approx_eq!(residual[1], -0.2, 1e-12);
    }

    #[test]
    fn sigma_points_project_each_column() {
        let meas = radar();
        let mut sigma = DMatrix::<f64>::zeros(5, 3);
        sigma.set_column(0, &DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0, 0.0]));
        sigma.set_column(1, &DVector::from_vec(vec![0.0, 2.0, 0.0, 0.0, 0.0]));
        sigma.set_column(2, &DVector::from_vec(vec![-3.0, 0.0, 0.0, 0.0, 0.0]));
        let z = meas.get_sigma_points(&sigma);
        assert_eq!(z.shape(), (3, 3));
        assert_approx_eq!(z[(0, 1)], 2.0, 1e-12);
        assert_approx_eq!(z[(1, 1)], PI / 2.0, 1e-12);
        assert_approx_eq!(z[(1, 2)], PI, 1e-12);
    }

    #[test]
    fn package_validation() {
        let good = MeasurementPackage::radar(0, 1.0, 0.5, 0.1);
        assert!(good.validate().is_ok());
        let bad = MeasurementPackage {
            timestamp: 0,
            sensor_type: SensorType::Lidar,
            raw_measurements: DVector::from_vec(vec![1.0, 2.0, 3.0]),
        };
        assert_eq!(
            bad.validate(),
            Err(FilterError::MalformedPacket {
                sensor: SensorType::Lidar,
                expected: 2,
                actual: 3
            })
        );
    }

    #[test]
    fn radar_initial_position_is_cartesian() {
        let pkg = MeasurementPackage::radar(0, 2.0, PI / 2.0, 0.0);
        let (px, py) = pkg.initial_position();
        assert_approx_eq!(px, 0.0, 1e-12);
        assert_approx_eq!(py, 2.0, 1e-12);
    }

    #[test]
    fn package_builds_matching_model() {
        let noise = SensorNoise::default();
        let model = MeasurementPackage::lidar(0, 1.0, 0.5).to_measurement(&noise);
        assert_eq!(model.get_sensor_type(), SensorType::Lidar);
        assert_eq!(model.get_vector(), DVector::from_vec(vec![1.0, 0.5]));
        let model = MeasurementPackage::radar(0, 1.0, 0.5, 0.2).to_measurement(&noise);
        assert_eq!(model.get_sensor_type(), SensorType::Radar);
        assert_approx_eq!(model.get_noise()[(1, 1)], 0.03 * 0.03, 1e-15);
    }
}

//! Lidar/radar sensor fusion with an unscented Kalman filter
//!
//! This crate provides a recursive Bayesian estimator that fuses position-only (lidar) and
//! range/bearing/range-rate (radar) observations of a single moving object into one continuously
//! updated belief about its planar position, speed, heading and turn rate. The filter is an
//! unscented Kalman filter (UKF) built on a constant turn rate and velocity (CTRV) motion model.
//! It is a single-target, online, forward-only estimator: there is no data association, sensor
//! calibration or smoothing.
//!
//! This crate is primarily built off of:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the linear algebra tools for the filter.
//! - [`serde`](https://crates.io/crates/serde) and [`csv`](https://crates.io/crates/csv): Configuration and measurement-feed I/O.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): Synthetic scenarios for consistency testing.
//!
//! ## Crate overview
//!
//! - [config]: Tunable process noise, fixed sensor noise and sensor enable flags.
//! - [error]: The [error::FilterError] type returned by every fallible step.
//! - [kalman]: Filter state, sigma-point generation, CTRV prediction and the unscented update.
//! - [linalg]: Covariance square roots and symmetric positive-definite solves.
//! - [measurements]: Measurement packets and the lidar and radar measurement models.
//! - [sim]: Measurement-feed CSV I/O, a batch driver, consistency diagnostics and synthetic scenarios.
//! - [tracker]: The controller that initializes the filter and sequences predict/update per packet.
//!
//! ## State definition
//!
//! $$
//! x = [p_x, p_y, v, \psi, \dot\psi]
//! $$
//!
//! Where:
//! - $p_x$, $p_y$ are the Cartesian position (m).
//! - $v$ is the speed along the heading (m/s).
//! - $\psi$ is the heading (rad), kept in (-π, π].
//! - $\dot\psi$ is the heading rate (rad/s).
//!
//! The process noise is modelled as a longitudinal acceleration $\nu_a$ and a yaw acceleration
//! $\nu_{\ddot\psi}$, both zero mean and constant over a prediction interval. They are appended to
//! the state to form the seven dimensional augmented state used for sigma-point generation.
//!
//! ## CTRV motion model
//!
//! Over an interval $\Delta t$, with $\dot\psi \neq 0$:
//!
//! $$
//! \begin{aligned}
//! p_x(+) &= p_x + \frac{v}{\dot\psi}\left(\sin(\psi + \dot\psi \Delta t) - \sin\psi\right) + \tfrac{1}{2}\Delta t^2 \cos\psi \, \nu_a \\\\
//! p_y(+) &= p_y + \frac{v}{\dot\psi}\left(\cos\psi - \cos(\psi + \dot\psi \Delta t)\right) + \tfrac{1}{2}\Delta t^2 \sin\psi \, \nu_a \\\\
//! v(+) &= v + \Delta t \, \nu_a \\\\
//! \psi(+) &= \psi + \dot\psi \Delta t + \tfrac{1}{2}\Delta t^2 \nu_{\ddot\psi} \\\\
//! \dot\psi(+) &= \dot\psi + \Delta t \, \nu_{\ddot\psi}
//! \end{aligned}
//! $$
//!
//! For $|\dot\psi|$ below [YAW_RATE_THRESHOLD] the position terms fall back to straight-line motion
//! $p_x(+) = p_x + v \Delta t \cos\psi$, $p_y(+) = p_y + v \Delta t \sin\psi$.
pub mod config;
pub mod error;
pub mod kalman;
pub mod linalg;
pub mod measurements;
pub mod sim;
pub mod tracker;

use nalgebra::{DMatrix, DVector};

use crate::error::FilterError;
use crate::measurements::MeasurementModel;

pub use crate::config::{ProcessNoise, SensorNoise, SensorSelection, TrackerConfig};
pub use crate::kalman::{FilterState, UnscentedKalmanFilter};
pub use crate::measurements::{MeasurementPackage, SensorType};
pub use crate::tracker::{ProcessOutcome, Tracker};

/// Heading rates below this magnitude use the straight-line motion approximation
pub const YAW_RATE_THRESHOLD: f64 = 1e-3;

/// Generic Bayesian filter trait that provides the predict/update interface the controller drives
pub trait TrackingFilter {
    fn predict(&mut self, dt: f64) -> Result<(), FilterError>;
    /// Correct the estimate with a measurement, returning its normalized innovation squared
    fn update<M: MeasurementModel + ?Sized>(&mut self, measurement: &M) -> Result<f64, FilterError>;
    fn get_estimate(&self) -> DVector<f64>;
    fn get_certainty(&self) -> DMatrix<f64>;
}

/// Propagate one augmented CTRV point `[px, py, v, yaw, yaw_rate, nu_a, nu_yawdd]` forward by `dt`
/// seconds, returning the five-element state `[px, py, v, yaw, yaw_rate]`.
///
/// The heading is returned unwrapped; callers normalize heading differences when recombining.
///
/// # Example
/// ```rust
/// use ctrv_fusion::ctrv_forward;
/// let next = ctrv_forward(&[0.0, 0.0, 10.0, 0.0, 0.0, 0.0, 0.0], 1.0);
/// assert_eq!(next, [10.0, 0.0, 10.0, 0.0, 0.0]);
/// ```
pub fn ctrv_forward(point: &[f64; 7], dt: f64) -> [f64; 5] {
    let [px, py, v, yaw, yaw_rate, nu_a, nu_yawdd] = *point;
    let (mut px_p, mut py_p) = if yaw_rate.abs() > YAW_RATE_THRESHOLD {
        (
            px + v / yaw_rate * ((yaw + yaw_rate * dt).sin() - yaw.sin()),
            py + v / yaw_rate * (yaw.cos() - (yaw + yaw_rate * dt).cos()),
        )
    } else {
        (px + v * dt * yaw.cos(), py + v * dt * yaw.sin())
    };
    let dt2 = dt * dt;
    px_p += 0.5 * nu_a * dt2 * yaw.cos();
    py_p += 0.5 * nu_a * dt2 * yaw.sin();
    let v_p = v + nu_a * dt;
    let yaw_p = yaw + yaw_rate * dt + 0.5 * nu_yawdd * dt2;
    let yaw_rate_p = yaw_rate + nu_yawdd * dt;
    [px_p, py_p, v_p, yaw_p, yaw_rate_p]
}

/// Wrap an angle to the range (-π, π] radians
///
/// The result is congruent to the input modulo 2π. Non-finite input is returned unchanged.
///
/// # Example
/// ```rust
/// use ctrv_fusion::wrap_to_pi;
/// use std::f64::consts::PI;
/// assert_eq!(wrap_to_pi(-PI), PI);
/// assert!((wrap_to_pi(3.0 * PI / 2.0) + PI / 2.0).abs() < 1e-12);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    use std::f64::consts::{PI, TAU};
    if !angle.is_finite() {
        return angle;
    }
    if angle > -PI && angle <= PI {
        return angle;
    }
    let wrapped = PI - (PI - angle).rem_euclid(TAU);
    if wrapped <= -PI { wrapped + TAU } else { wrapped }
}

//! Unscented Kalman filter for the CTRV motion model
//!
//! This module contains the filter state and the three stages of the unscented Kalman filter:
//!
//! 1. **Sigma-point generation** ([augmented_sigma_points]): the state is augmented with the two
//!    process noise terms and `2 n_aug + 1` deterministic sample points are drawn from the
//!    Cholesky factor of the augmented covariance.
//! 2. **Prediction** ([predict]): each sigma point is propagated through [crate::ctrv_forward]
//!    and the predicted mean and covariance are recombined from the weighted points.
//! 3. **Update** ([unscented_update]): the predicted sigma points are projected through a
//!    [MeasurementModel], and the innovation, cross-correlation and Kalman gain correct the
//!    state. The same routine serves lidar and radar; the model decides which residual
//!    components are angles.
//!
//! Every stage consumes a [FilterState] by reference and returns a new one, so a failing stage
//! never leaves a partially updated state behind.

use std::fmt::{self, Debug, Display};

use log::{trace, warn};
use nalgebra::{DMatrix, DVector};

use crate::config::ProcessNoise;
use crate::error::FilterError;
use crate::linalg::{
    floor_eigenvalues, is_positive_definite, matrix_square_root, spd_solve, symmetrize,
};
use crate::measurements::MeasurementModel;
use crate::{TrackingFilter, ctrv_forward, wrap_to_pi};

/// Dimension of the state `[px, py, v, yaw, yaw_rate]`
pub const STATE_SIZE: usize = 5;
/// Dimension of the state augmented with the two process noise terms
pub const AUGMENTED_SIZE: usize = 7;
/// Number of sigma points, `2 n_aug + 1`
pub const SIGMA_POINT_COUNT: usize = 2 * AUGMENTED_SIZE + 1;
/// Sigma point spreading parameter, `3 - n_aug`
pub const LAMBDA: f64 = 3.0 - AUGMENTED_SIZE as f64;
/// Index of the heading in the state vector
pub const YAW_INDEX: usize = 3;

/// Sigma point weights: `λ / (λ + n_aug)` for the center point and `1 / (2 (λ + n_aug))` for the
/// others. The center weight is negative for this choice of λ; the weights still sum to one.
pub fn sigma_point_weights() -> DVector<f64> {
    let n = AUGMENTED_SIZE as f64;
    let mut weights = DVector::from_element(SIGMA_POINT_COUNT, 0.5 / (LAMBDA + n));
    weights[0] = LAMBDA / (LAMBDA + n);
    weights
}

/// Difference of two state vectors with the heading component wrapped to (-π, π]
pub fn state_residual(a: &DVector<f64>, b: &DVector<f64>) -> DVector<f64> {
    let mut diff = a - b;
    diff[YAW_INDEX] = wrap_to_pi(diff[YAW_INDEX]);
    diff
}

/// The filter belief: mean, covariance, the last predicted sigma points and their weights
#[derive(Clone, Debug, PartialEq)]
pub struct FilterState {
    /// `[px, py, v, yaw, yaw_rate]`
    pub mean: DVector<f64>,
    /// 5x5, symmetric positive semi-definite
    pub covariance: DMatrix<f64>,
    /// 5x15 sigma points from the last prediction. `None` until the first prediction and after
    /// every update, since an update moves the belief away from the points it consumed.
    pub predicted_sigma_points: Option<DMatrix<f64>>,
    pub weights: DVector<f64>,
}
impl FilterState {
    /// Build a state from a mean and covariance; the heading is wrapped to (-π, π].
    ///
    /// # Panics
    /// If `mean` does not have 5 elements or `covariance` is not 5x5.
    pub fn new(mean: DVector<f64>, covariance: DMatrix<f64>) -> FilterState {
        assert_eq!(mean.len(), STATE_SIZE, "FilterState: mean must have 5 elements");
        assert_eq!(
            covariance.shape(),
            (STATE_SIZE, STATE_SIZE),
            "FilterState: covariance must be 5x5"
        );
        let mut mean = mean;
        mean[YAW_INDEX] = wrap_to_pi(mean[YAW_INDEX]);
        FilterState {
            mean,
            covariance,
            predicted_sigma_points: None,
            weights: sigma_point_weights(),
        }
    }
    /// Stationary object at `(px, py)` with unit variance in every dimension
    pub fn from_position(px: f64, py: f64) -> FilterState {
        FilterState::new(
            DVector::from_vec(vec![px, py, 0.0, 0.0, 0.0]),
            DMatrix::identity(STATE_SIZE, STATE_SIZE),
        )
    }
    pub fn position(&self) -> (f64, f64) {
        (self.mean[0], self.mean[1])
    }
    pub fn speed(&self) -> f64 {
        self.mean[2]
    }
    pub fn yaw(&self) -> f64 {
        self.mean[YAW_INDEX]
    }
    pub fn yaw_rate(&self) -> f64 {
        self.mean[4]
    }
    /// Cartesian velocity `(v cos ψ, v sin ψ)`
    pub fn velocity(&self) -> (f64, f64) {
        let (v, yaw) = (self.speed(), self.yaw());
        (v * yaw.cos(), v * yaw.sin())
    }
}
impl Display for FilterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (vx, vy) = self.velocity();
        write!(
            f,
            "FilterState(px: {:.4}, py: {:.4}, v: {:.4}, yaw: {:.4}, yaw_rate: {:.4}, vx: {:.4}, vy: {:.4})",
            self.mean[0], self.mean[1], self.mean[2], self.mean[3], self.mean[4], vx, vy
        )
    }
}

/// Generate the `7 x 15` augmented sigma point matrix for a state.
///
/// The augmented mean is `[x; 0; 0]` and the augmented covariance is
/// `blockdiag(P, std_a², std_yawdd²)`. Column 0 is the mean, columns `1..=7` and `8..=14` are the
/// mean plus and minus `√(λ + n_aug)` times the columns of the lower Cholesky factor.
pub fn augmented_sigma_points(
    state: &FilterState,
    process_noise: &ProcessNoise,
) -> Result<DMatrix<f64>, FilterError> {
    let mut x_aug = DVector::<f64>::zeros(AUGMENTED_SIZE);
    x_aug.rows_mut(0, STATE_SIZE).copy_from(&state.mean);

    let mut p_aug = DMatrix::<f64>::zeros(AUGMENTED_SIZE, AUGMENTED_SIZE);
    p_aug
        .view_mut((0, 0), (STATE_SIZE, STATE_SIZE))
        .copy_from(&state.covariance);
    p_aug[(5, 5)] = process_noise.std_a.powi(2);
    p_aug[(6, 6)] = process_noise.std_yawdd.powi(2);

    let sqrt_p = matrix_square_root(&p_aug).map_err(|e| match e {
        FilterError::NotPositiveDefinite { context } => FilterError::NotPositiveDefinite {
            context: format!("augmented covariance: {}", context),
        },
        other => other,
    })?;
    let spread = (LAMBDA + AUGMENTED_SIZE as f64).sqrt();

    let mut pts = DMatrix::<f64>::zeros(AUGMENTED_SIZE, SIGMA_POINT_COUNT);
    pts.column_mut(0).copy_from(&x_aug);
    for i in 0..AUGMENTED_SIZE {
        let offset = spread * sqrt_p.column(i);
        pts.column_mut(i + 1).copy_from(&(&x_aug + &offset));
        pts.column_mut(i + 1 + AUGMENTED_SIZE)
            .copy_from(&(&x_aug - &offset));
    }
    Ok(pts)
}

/// Propagate every augmented sigma point through the CTRV model, yielding the `5 x 15` predicted
/// sigma points.
pub fn predict_sigma_points(augmented: &DMatrix<f64>, dt: f64) -> DMatrix<f64> {
    let mut predicted = DMatrix::<f64>::zeros(STATE_SIZE, augmented.ncols());
    for (i, column) in augmented.column_iter().enumerate() {
        let point = [
            column[0], column[1], column[2], column[3], column[4], column[5], column[6],
        ];
        let next = ctrv_forward(&point, dt);
        predicted.column_mut(i).copy_from_slice(&next);
    }
    predicted
}

/// Recombine predicted sigma points into a mean and covariance.
///
/// The mean is the weighted sum of the points and the covariance the weighted sum of outer
/// products of their deviations. Heading deviations are wrapped before forming the outer
/// products; the returned mean has its heading wrapped as well.
pub fn predict_mean_and_covariance(
    sigma_points: &DMatrix<f64>,
    weights: &DVector<f64>,
) -> (DVector<f64>, DMatrix<f64>) {
    // Weighted sum taken relative to the center point, so headings never average across ±π
    let center = sigma_points.column(0).clone_owned();
    let mut mu_bar = center.clone();
    for (i, sigma_point) in sigma_points.column_iter().enumerate() {
        mu_bar += weights[i] * state_residual(&sigma_point.clone_owned(), &center);
    }
    let mut p_bar = DMatrix::<f64>::zeros(sigma_points.nrows(), sigma_points.nrows());
    for (i, sigma_point) in sigma_points.column_iter().enumerate() {
        let diff = state_residual(&sigma_point.clone_owned(), &mu_bar);
        p_bar += weights[i] * &diff * diff.transpose();
    }
    mu_bar[YAW_INDEX] = wrap_to_pi(mu_bar[YAW_INDEX]);
    (mu_bar, symmetrize(&p_bar))
}

/// Prediction step: sigma-point generation, CTRV propagation and recombination over `dt` seconds.
pub fn predict(
    state: &FilterState,
    process_noise: &ProcessNoise,
    dt: f64,
) -> Result<FilterState, FilterError> {
    let augmented = augmented_sigma_points(state, process_noise)?;
    let predicted = predict_sigma_points(&augmented, dt);
    let (mean, covariance) = predict_mean_and_covariance(&predicted, &state.weights);
    Ok(FilterState {
        mean,
        covariance,
        predicted_sigma_points: Some(predicted),
        weights: state.weights.clone(),
    })
}

/// Result of a measurement update
#[derive(Clone, Debug)]
pub struct UpdateOutcome {
    pub state: FilterState,
    /// Measurement minus predicted measurement, angle components wrapped
    pub innovation: DVector<f64>,
    /// Normalized innovation squared `yᵀ S⁻¹ y`
    pub nis: f64,
}

/// Generic unscented measurement update.
///
/// With `Z` the measurement sigma points, `ẑ` their weighted mean, `R` the measurement noise and
/// `X` the predicted state sigma points:
///
/// $$
/// \begin{aligned}
/// S &= \sum_i w_i (Z_i - \hat z)(Z_i - \hat z)^T + R \\\\
/// T &= \sum_i w_i (X_i - \bar x)(Z_i - \hat z)^T \\\\
/// K &= T S^{-1} \\\\
/// x &= \bar x + K (z - \hat z) \\\\
/// P &= \bar P - K S K^T
/// \end{aligned}
/// $$
///
/// State residuals wrap the heading and measurement residuals wrap whatever the model declares
/// angular.
pub fn unscented_update<M: MeasurementModel + ?Sized>(
    state: &FilterState,
    sigma_points: &DMatrix<f64>,
    measurement: &M,
) -> Result<UpdateOutcome, FilterError> {
    let dim = measurement.get_dimension();
    let weights = &state.weights;
    let measurement_sigma_points = measurement.get_sigma_points(sigma_points);

    // Weighted mean relative to the center point, so bearings never average across ±π
    let z_center = measurement_sigma_points.column(0).clone_owned();
    let mut z_hat = z_center.clone();
    for (i, z) in measurement_sigma_points.column_iter().enumerate() {
        z_hat += weights[i] * measurement.get_residual(&z.clone_owned(), &z_center);
    }

    let mut s = DMatrix::<f64>::zeros(dim, dim);
    let mut cross_covariance = DMatrix::<f64>::zeros(STATE_SIZE, dim);
    for i in 0..measurement_sigma_points.ncols() {
        let z_diff =
            measurement.get_residual(&measurement_sigma_points.column(i).clone_owned(), &z_hat);
        let x_diff = state_residual(&sigma_points.column(i).clone_owned(), &state.mean);
        s += weights[i] * &z_diff * z_diff.transpose();
        cross_covariance += weights[i] * x_diff * z_diff.transpose();
    }
    let noise = measurement.get_noise();
    s += &noise;
    let mut s = symmetrize(&s);
    // The negative center weight can leave S indefinite when the projection is strongly
    // nonlinear (radar near the origin). S is bounded below by R, so floor it there.
    if !is_positive_definite(&s) {
        let floor = noise.diagonal().min();
        warn!(
            "{} innovation covariance not positive definite, flooring eigenvalues at {:e}",
            measurement.get_sensor_type(),
            floor
        );
        s = floor_eigenvalues(&s, floor);
    }

    // K = T S⁻¹, solved as S Kᵀ = Tᵀ
    let k = spd_solve(&s, &cross_covariance.transpose())?.transpose();
    let innovation = measurement.get_residual(&measurement.get_vector(), &z_hat);
    let innovation_mat = DMatrix::from_column_slice(dim, 1, innovation.as_slice());
    let nis = innovation.dot(&spd_solve(&s, &innovation_mat)?.column(0));

    let mut mean = &state.mean + &k * &innovation;
    mean[YAW_INDEX] = wrap_to_pi(mean[YAW_INDEX]);
    let covariance = symmetrize(&(&state.covariance - &k * &s * k.transpose()));
    trace!(
        "{} update: innovation {:?}, nis {:.4}",
        measurement.get_sensor_type(),
        innovation.as_slice(),
        nis
    );
    Ok(UpdateOutcome {
        state: FilterState {
            mean,
            covariance,
            predicted_sigma_points: None,
            weights: weights.clone(),
        },
        innovation,
        nis,
    })
}

/// Unscented Kalman filter over the CTRV state
#[derive(Clone)]
pub struct UnscentedKalmanFilter {
    state: FilterState,
    process_noise: ProcessNoise,
}
impl Debug for UnscentedKalmanFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UKF")
            .field("mean", &self.state.mean)
            .field("covariance", &self.state.covariance)
            .field("process_noise", &self.process_noise)
            .finish()
    }
}
impl Display for UnscentedKalmanFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnscentedKalmanFilter({})", self.state)
    }
}
impl UnscentedKalmanFilter {
    pub fn new(state: FilterState, process_noise: ProcessNoise) -> UnscentedKalmanFilter {
        UnscentedKalmanFilter {
            state,
            process_noise,
        }
    }
    pub fn get_state(&self) -> &FilterState {
        &self.state
    }
    /// Replace the belief, e.g. to replay from a snapshot taken with [Self::get_state]
    pub fn set_state(&mut self, state: FilterState) {
        self.state = state;
    }
    pub fn get_process_noise(&self) -> &ProcessNoise {
        &self.process_noise
    }
    /// Update returning the full outcome rather than only the NIS
    pub fn update_with_outcome<M: MeasurementModel + ?Sized>(
        &mut self,
        measurement: &M,
    ) -> Result<UpdateOutcome, FilterError> {
        // Without fresh predicted points (no prediction yet, or already consumed by an update),
        // sample the current belief with a zero-length step
        let sigma_points = match &self.state.predicted_sigma_points {
            Some(points) => points.clone(),
            None => {
                let augmented = augmented_sigma_points(&self.state, &self.process_noise)?;
                predict_sigma_points(&augmented, 0.0)
            }
        };
        let mut prior = self.state.clone();
        prior.predicted_sigma_points = Some(sigma_points.clone());
        let outcome = unscented_update(&prior, &sigma_points, measurement)?;
        self.state = outcome.state.clone();
        Ok(outcome)
    }
}
impl TrackingFilter for UnscentedKalmanFilter {
    fn predict(&mut self, dt: f64) -> Result<(), FilterError> {
        self.state = predict(&self.state, &self.process_noise, dt)?;
        Ok(())
    }
    fn update<M: MeasurementModel + ?Sized>(&mut self, measurement: &M) -> Result<f64, FilterError> {
        self.update_with_outcome(measurement).map(|outcome| outcome.nis)
    }
    fn get_estimate(&self) -> DVector<f64> {
        self.state.mean.clone()
    }
    fn get_certainty(&self) -> DMatrix<f64> {
        self.state.covariance.clone()
    }
}

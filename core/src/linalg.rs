//! Linear algebra helpers for covariance square roots and solves.
//!
//! Public API:
//!     pub fn matrix_square_root(matrix: &DMatrix<f64>) -> Result<DMatrix<f64>, FilterError>
//!     pub fn spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>, FilterError>
//!     pub fn floor_eigenvalues(m: &DMatrix<f64>, floor: f64) -> DMatrix<f64>
//!
//! Internal pipeline (each step isolated for testing):
//!     - symmetrize()
//!     - cholesky_with_jitter()
//!     - evd_sqrt_with_floor()
//!
//! Strategy:
//! 1) Symmetrize P ← 0.5 (P + Pᵀ)
//! 2) Cholesky
//! 3) Jittered Cholesky (geometric ramp, scaled by the mean diagonal magnitude of P)
//! 4) Symmetric EVD with eigenvalue floor → S = U * sqrt(Λ⁺) * Uᵀ
//!
//! Only a matrix with non-finite entries has no square root; that is reported as
//! [`FilterError::NotPositiveDefinite`] and the caller keeps its prior state.

use log::warn;
use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{DMatrix, Dyn};

use crate::error::FilterError;

/// Jitter ramp, relative to the mean diagonal magnitude of the matrix being factored
#[derive(Debug, Clone, Copy)]
pub struct JitterOptions {
    pub initial_jitter: f64, // e.g., 1e-12
    pub max_jitter: f64,     // e.g., 1e-6
    pub max_tries: usize,    // e.g., 7
}

impl Default for JitterOptions {
    fn default() -> Self {
        Self {
            initial_jitter: 1e-12,
            max_jitter: 1e-6,
            max_tries: 7,
        }
    }
}

/// Relative eigenvalue floor of the EVD fallback
const EIGEN_FLOOR: f64 = 1e-12;

/// Compute a square root `S` such that `matrix ≈ S * Sᵀ`.
///
/// Attempts plain Cholesky first. If that fails (the matrix is only semi-definite, or has picked
/// up round-off), a diagonal jitter proportional to the matrix's scale is added on a geometric
/// ramp and Cholesky retried. As a last resort the symmetric eigendecomposition is taken with
/// the eigenvalues floored at a small positive value.
///
/// # Arguments
/// * `matrix` - square, nominally symmetric positive-definite matrix
///
/// # Returns
/// * `Ok(S)`; lower triangular when Cholesky succeeded, symmetric from the EVD fallback
/// * `Err(FilterError::NotPositiveDefinite)` if the matrix is not square or has non-finite entries
pub fn matrix_square_root(matrix: &DMatrix<f64>) -> Result<DMatrix<f64>, FilterError> {
    if !matrix.is_square() {
        return Err(FilterError::NotPositiveDefinite {
            context: format!(
                "square root of a non-square {}x{} matrix",
                matrix.nrows(),
                matrix.ncols()
            ),
        });
    }
    if !is_finite(matrix) {
        return Err(FilterError::NotPositiveDefinite {
            context: "square root of a matrix with non-finite entries".to_string(),
        });
    }
    let p = symmetrize(matrix);
    if let Some((ch, jitter)) = cholesky_with_jitter(&p, JitterOptions::default()) {
        if jitter > 0.0 {
            warn!("covariance square root required diagonal jitter of {:e}", jitter);
        }
        return Ok(ch.l());
    }
    let floor = EIGEN_FLOOR * diagonal_scale(&p);
    warn!(
        "covariance is not positive definite, flooring eigenvalues at {:e}",
        floor
    );
    Ok(evd_sqrt_with_floor(&p, floor))
}

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
///
/// Removes the round-off asymmetry that accumulates in covariance updates.
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

/// Symmetric matrix with every eigenvalue of `m` raised to at least `floor`:
/// U * max(Λ, floor) * Uᵀ
pub fn floor_eigenvalues(m: &DMatrix<f64>, floor: f64) -> DMatrix<f64> {
    let se = SymmetricEigen::new(symmetrize(m));
    let lambdas = se.eigenvalues.map(|l| l.max(floor));
    let u = se.eigenvectors;
    symmetrize(&(&u * DMatrix::from_diagonal(&lambdas) * u.transpose()))
}

fn is_finite(m: &DMatrix<f64>) -> bool {
    m.iter().all(|x| x.is_finite())
}

/// Mean diagonal magnitude, never below one so that small matrices keep absolute jitter
fn diagonal_scale(p: &DMatrix<f64>) -> f64 {
    let n = p.nrows().max(1) as f64;
    (p.trace().abs() / n).max(1.0)
}

/// Cholesky, retried with diagonal jitter on a geometric ramp if the plain factorization fails.
/// Returns the factorization along with the absolute jitter that made it succeed (zero for the
/// plain attempt), or None if all tries fail.
fn cholesky_with_jitter(
    p: &DMatrix<f64>,
    opt: JitterOptions,
) -> Option<(Cholesky<f64, Dyn>, f64)> {
    if let Some(ch) = Cholesky::new(p.clone()) {
        return Some((ch, 0.0));
    }
    let scale = diagonal_scale(p);
    let mut jitter = opt.initial_jitter;
    for _ in 0..opt.max_tries {
        if jitter > opt.max_jitter {
            break;
        }
        if let Some(ch) = Cholesky::new(add_diagonal(p, jitter * scale)) {
            return Some((ch, jitter * scale));
        }
        jitter *= 10.0;
    }
    None
}

fn add_diagonal(p: &DMatrix<f64>, value: f64) -> DMatrix<f64> {
    let mut out = p.clone();
    for i in 0..out.nrows() {
        out[(i, i)] += value;
    }
    out
}

/// Symmetric EVD square root with eigenvalue flooring:
/// S = U * sqrt(max(λ, floor)) * Uᵀ
fn evd_sqrt_with_floor(p: &DMatrix<f64>, floor: f64) -> DMatrix<f64> {
    let se = SymmetricEigen::new(p.clone());
    let sqrt_vals = se.eigenvalues.map(|l| l.max(floor).sqrt());
    let u = se.eigenvectors;
    &u * DMatrix::from_diagonal(&sqrt_vals) * u.transpose()
}

/// Solve A X = B for symmetric positive-definite A via Cholesky, with jitter retries.
///
/// Used for the Kalman gain (`K = Tc S⁻¹`, solved as `S Kᵀ = Tcᵀ`) and the normalized innovation
/// squared, so that `S` is never explicitly inverted.
pub fn spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>, FilterError> {
    if !a.is_square() || a.nrows() != b.nrows() {
        return Err(FilterError::SingularMatrix {
            context: format!(
                "incompatible system: A is {}x{}, B is {}x{}",
                a.nrows(),
                a.ncols(),
                b.nrows(),
                b.ncols()
            ),
        });
    }
    if !is_finite(a) {
        return Err(FilterError::SingularMatrix {
            context: "innovation covariance has non-finite entries".to_string(),
        });
    }
    match cholesky_with_jitter(&symmetrize(a), JitterOptions::default()) {
        Some((ch, jitter)) => {
            if jitter > 0.0 {
                warn!("innovation covariance solve required diagonal jitter of {:e}", jitter);
            }
            Ok(ch.solve(b))
        }
        None => Err(FilterError::SingularMatrix {
            context: "innovation covariance is not positive definite".to_string(),
        }),
    }
}

/// True if Cholesky factorization of `m` succeeds without jitter
pub fn is_positive_definite(m: &DMatrix<f64>) -> bool {
    m.is_square() && Cholesky::new(m.clone()).is_some()
}

/// True if `m` is symmetric and its smallest eigenvalue is no lower than `-tolerance`.
pub fn is_positive_semi_definite(m: &DMatrix<f64>, tolerance: f64) -> bool {
    if !m.is_square() {
        return false;
    }
    let scale = m.amax().max(1.0);
    if (m - m.transpose()).amax() > tolerance * scale {
        return false;
    }
    let se = SymmetricEigen::new(symmetrize(m));
    se.eigenvalues.iter().all(|&l| l >= -tolerance * scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn approx_eq(a: &DMatrix<f64>, b: &DMatrix<f64>, tol: f64) -> bool {
        if a.shape() != b.shape() {
            return false;
        }
        (a - b).amax() <= tol
    }

    #[test]
    fn t_symmetrize() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 0.0, 3.0]);
        let s = symmetrize(&m);
        let s_expected = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 3.0]);
        assert!(approx_eq(&s, &s_expected, 1e-15));
    }

    #[test]
    fn t_cholesky_spd() {
        let a = DMatrix::from_row_slice(3, 3, &[1.0, 2.0, 0.5, 0.0, 1.0, -1.0, 0.0, 0.0, 0.2]);
        let p = &a * a.transpose();
        let (ch, jitter) = cholesky_with_jitter(&p, JitterOptions::default())
            .expect("Cholesky should succeed for SPD");
        assert_eq!(jitter, 0.0);
        let s = ch.l();
        let back = &s * s.transpose();
        assert!(approx_eq(&back, &p, 1e-12));
    }

    #[test]
    fn t_cholesky_indefinite_none() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]); // eigenvalues: 3, -1
        assert!(cholesky_with_jitter(&m, JitterOptions::default()).is_none());
        assert!(!is_positive_definite(&m));
    }

    #[test]
    fn t_jitter_rescues_semi_definite() {
        // Augmented covariance with a zero noise block is only semi-definite
        let mut p = DMatrix::<f64>::identity(3, 3);
        p[(2, 2)] = 0.0;
        let (ch, jitter) = cholesky_with_jitter(&p, JitterOptions::default())
            .expect("jittered Cholesky should succeed");
        assert!(jitter > 0.0 && jitter <= 1e-6);
        let s = ch.l();
        let back = &s * s.transpose();
        assert!(approx_eq(&back, &p, 1e-6));
    }

    #[test]
    fn t_jitter_scales_with_magnitude() {
        // Rank-deficient at 1e14 scale: absolute jitter of 1e-6 is lost in round-off
        let v = DMatrix::from_column_slice(3, 1, &[1e7, 2e7, -1e7]);
        let p = &v * v.transpose();
        let (ch, jitter) = cholesky_with_jitter(&p, JitterOptions::default())
            .expect("scaled jitter should rescue a large semi-definite matrix");
        assert!(jitter > 1e-6);
        let s = ch.l();
        let back = &s * s.transpose();
        assert!((&back - &p).amax() <= 1e-6 * p.amax());
    }

    #[test]
    fn t_public_identity() {
        let i = DMatrix::<f64>::identity(4, 4);
        let s = matrix_square_root(&i).unwrap();
        assert!(approx_eq(&s, &i, 1e-14));
    }

    #[test]
    fn t_public_nearly_spd() {
        let a = DMatrix::from_row_slice(3, 3, &[1.0, 0.1, 0.0, 0.0, 1.0, 0.2, 0.0, 0.0, 1.0]);
        let mut p = &a * a.transpose();
        p[(0, 2)] += 1e-12; // asymmetry
        let s = matrix_square_root(&p).unwrap();
        let back = &s * s.transpose();
        assert!(approx_eq(&back, &symmetrize(&p), 1e-9));
    }

    #[test]
    fn t_public_indefinite_uses_eigen_floor() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        let s = matrix_square_root(&m).unwrap();
        let back = &s * s.transpose();
        // Positive eigenvalue 3 along (1, 1) survives, the negative one is floored away
        assert_approx_eq!(back[(0, 0)], 1.5, 1e-9);
        assert_approx_eq!(back[(0, 1)], 1.5, 1e-9);
        assert!(is_positive_semi_definite(&back, 1e-9));
    }

    #[test]
    fn t_public_non_finite_is_error() {
        let mut m = DMatrix::<f64>::identity(3, 3);
        m[(1, 1)] = f64::NAN;
        let err = matrix_square_root(&m).unwrap_err();
        assert!(matches!(err, FilterError::NotPositiveDefinite { .. }));
    }

    #[test]
    fn t_floor_eigenvalues() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        let floored = floor_eigenvalues(&m, 0.5);
        assert!(is_positive_definite(&floored));
        let se = SymmetricEigen::new(floored.clone());
        let mut eig: Vec<f64> = se.eigenvalues.iter().copied().collect();
        eig.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_approx_eq!(eig[0], 0.5, 1e-9);
        assert_approx_eq!(eig[1], 3.0, 1e-9);
        // Already above the floor: unchanged
        let spd = DMatrix::from_row_slice(2, 2, &[4.0, 2.0, 2.0, 3.0]);
        assert!(approx_eq(&floor_eigenvalues(&spd, 0.5), &spd, 1e-10));
    }

    #[test]
    fn t_public_non_square_is_error() {
        let m = DMatrix::<f64>::zeros(3, 2);
        assert!(matrix_square_root(&m).is_err());
    }

    #[test]
    fn t_spd_solve_basic() {
        let a = DMatrix::from_row_slice(2, 2, &[4.0, 2.0, 2.0, 3.0]);
        let b = DMatrix::from_row_slice(2, 1, &[6.0, 5.0]);
        let x = spd_solve(&a, &b).unwrap();
        assert!(approx_eq(&(&a * &x), &b, 1e-10));
    }

    #[test]
    fn t_spd_solve_singular() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -1.0]);
        let b = DMatrix::from_row_slice(2, 1, &[1.0, 1.0]);
        let err = spd_solve(&a, &b).unwrap_err();
        assert!(matches!(err, FilterError::SingularMatrix { .. }));
    }

    #[test]
    fn t_spd_solve_incompatible() {
        let a = DMatrix::<f64>::identity(2, 2);
        let b = DMatrix::<f64>::zeros(3, 1);
        assert!(spd_solve(&a, &b).is_err());
    }

    #[test]
    fn t_psd_check() {
        let p = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 2.0]);
        assert!(is_positive_semi_definite(&p, 1e-9));
        let indefinite = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(!is_positive_semi_definite(&indefinite, 1e-9));
        let asymmetric = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.0, 1.0]);
        assert!(!is_positive_semi_definite(&asymmetric, 1e-9));
    }
}

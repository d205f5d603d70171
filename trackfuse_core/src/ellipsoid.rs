//! The "ELLIPSOID" Engine - Squared Distance Kernels
//!
//! Both distances the matcher ranks candidates by:
//! - Squared Euclidean distance between two spot centers
//! - Squared Mahalanobis distance of a point against a spot's ellipsoid
//!
//! D² = (p - μ)ᵀ Σ⁻¹ (p - μ)
//!
//! D² equals 1 exactly on the ellipsoid surface, so cutoffs expressed
//! in "number of ellipsoid radii" square directly into this space.
//!
//! The 3x3 inverse is expanded in closed form via the cofactor matrix
//! rather than a generic LU factorization; covariances here are tiny
//! and symmetric, and the expansion costs a handful of multiplies.

use nalgebra::{Matrix3, Vector3};

/// Squared Euclidean distance between two points.
#[inline]
pub fn squared_distance(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    (b - a).norm_squared()
}

/// Squared Mahalanobis distance of `point` against the ellipsoid
/// centered at `mean` with shape matrix `covariance`.
///
/// Returns `f64::MAX` when the covariance is singular or not positive
/// definite, so degenerate ellipsoids never pass a finite cutoff.
pub fn squared_mahalanobis(
    mean: &Vector3<f64>,
    covariance: &Matrix3<f64>,
    point: &Vector3<f64>,
) -> f64 {
    let c00 = covariance[(0, 0)];
    let c01 = covariance[(0, 1)];
    let c02 = covariance[(0, 2)];
    let c11 = covariance[(1, 1)];
    let c12 = covariance[(1, 2)];
    let c22 = covariance[(2, 2)];

    // Cofactors of the symmetric matrix; the adjugate equals the
    // cofactor matrix because the input is symmetric.
    let cof00 = c11 * c22 - c12 * c12;
    let cof01 = c02 * c12 - c01 * c22;
    let cof02 = c01 * c12 - c02 * c11;
    let cof11 = c00 * c22 - c02 * c02;
    let cof12 = c01 * c02 - c00 * c12;
    let cof22 = c00 * c11 - c01 * c01;

    let det = c00 * cof00 + c01 * cof01 + c02 * cof02;

    // A positive-definite matrix has det > 0; anything else (zero,
    // negative, subnormal, NaN) is treated as singular.
    if !(det >= f64::MIN_POSITIVE) {
        return f64::MAX;
    }

    let d = point - mean;
    (d.x * d.x * cof00
        + d.y * d.y * cof11
        + d.z * d.z * cof22
        + 2.0 * (d.x * d.y * cof01 + d.x * d.z * cof02 + d.y * d.z * cof12))
        / det
}

// ============================================================================
// TESTS
// ============================================================================

//! Closed-form Fréchet distance between two Gaussians.
//!
//! The square roots go through an SVD rather than an eigendecomposition: covariances
//! estimated from a few thousand 2048-dimensional features are close to singular and
//! rarely exactly symmetric after rounding.
use crate::{error::FidError, stats::GaussianStats};
use tch::{Kind, Tensor};

/// Singular values under this are kept as they are instead of being square-rooted.
const SINGULAR_VALUE_FLOOR: f64 = 1e-10;

/// Symmetric square root `U diag(sqrt(s)) V^T` of a square matrix.
pub fn sym_matrix_sqrt(mat: &Tensor) -> Result<Tensor, FidError> {
    let (u, s, v) = mat
        .f_svd(true, true)
        .map_err(|e| FidError::NumericalInstability(format!("svd failed: {}", e)))?;
    let s = s.where_self(&s.lt(SINGULAR_VALUE_FLOOR), &s.sqrt());
    Ok(u.mm(&s.diag(0)).mm(&v.tr()))
}

/// `trace(sqrt(sqrt(cov1) cov2 sqrt(cov1)))`, which equals `trace(sqrt(cov1 cov2))`.
pub fn trace_sqrt_product(cov1: &Tensor, cov2: &Tensor) -> Result<f64, FidError> {
    let sqrt_cov1 = sym_matrix_sqrt(cov1)?;
    let product = sqrt_cov1.mm(&cov2.mm(&sqrt_cov1));
    Ok(sym_matrix_sqrt(&product)?.trace().double_value(&[]))
}

/// `||mu1 - mu2||^2 + tr(cov1) + tr(cov2) - 2 tr(sqrt(cov1 cov2))`.
///
/// The value is not clamped: distributions that nearly coincide may produce a small
/// negative number. A NaN is reported as [`FidError::NumericalInstability`].
pub fn frechet_distance(a: &GaussianStats, b: &GaussianStats) -> Result<f64, FidError> {
    let (d, other) = (a.dim()?, b.dim()?);
    if other != d {
        return Err(FidError::Shape(format!(
            "cannot compare statistics of dimension {} and {}",
            d, other
        )));
    }
    let cov1 = a.cov.to_kind(Kind::Double);
    let cov2 = b.cov.to_kind(Kind::Double);
    let diff = a.mu.to_kind(Kind::Double) - b.mu.to_kind(Kind::Double);
    let m = (&diff * &diff).sum(Kind::Double).double_value(&[]);
    let s = trace_sqrt_product(&cov1, &cov2)?;
    let trace1 = cov1.trace().double_value(&[]);
    let trace2 = cov2.trace().double_value(&[]);
    let dist = m + trace1 + trace2 - 2.0 * s;
    if dist.is_nan() {
        return Err(FidError::NumericalInstability(format!(
            "NaN distance (mean term {}, traces {} and {}, sqrt term {})",
            m, trace1, trace2, s
        )));
    }
    Ok(dist)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    const OPTS: (Kind, Device) = (Kind::Double, Device::Cpu);

    fn random_spd(d: i64) -> Tensor {
        let a = Tensor::randn(&[d, d], OPTS);
        a.mm(&a.tr()) + Tensor::eye(d, OPTS) * 0.5
    }

    fn stats(mu: Tensor, cov: Tensor) -> GaussianStats {
        GaussianStats { mu, cov }
    }

    #[test]
    fn sqrt_squared_gives_back_the_matrix() {
        let mat = random_spd(6);
        let root = sym_matrix_sqrt(&mat).unwrap();
        assert!(root.mm(&root).allclose(&mat, 1e-8, 1e-8, false));
        assert!(root.allclose(&root.tr(), 1e-8, 1e-8, false));
    }

    #[test]
    fn tiny_singular_values_are_not_square_rooted() {
        let mat = Tensor::of_slice(&[4., 0., 0., 1e-12]).view([2, 2]);
        let root = sym_matrix_sqrt(&mat).unwrap();
        assert!((root.double_value(&[0, 0]) - 2.).abs() < 1e-12);
        assert!((root.double_value(&[1, 1]) - 1e-12).abs() < 1e-20);
    }

    #[test]
    fn identical_distributions_are_at_zero() {
        let mu = Tensor::randn(&[5], OPTS);
        let cov = random_spd(5);
        let a = stats(mu.copy(), cov.copy());
        let b = stats(mu, cov);
        let dist = frechet_distance(&a, &b).unwrap();
        assert!(dist.abs() < 1e-8, "dist = {}", dist);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = stats(Tensor::randn(&[4], OPTS), random_spd(4));
        let b = stats(Tensor::randn(&[4], OPTS), random_spd(4));
        let ab = frechet_distance(&a, &b).unwrap();
        let ba = frechet_distance(&b, &a).unwrap();
        assert!((ab - ba).abs() < 1e-8 * ab.abs().max(1.), "{} vs {}", ab, ba);
        assert!(ab > 0.);
    }

    #[test]
    fn diagonal_covariances_match_closed_form() {
        let var1 = [1.0, 4.0, 0.25, 9.0];
        let var2 = [2.0, 1.0, 0.5, 16.0];
        let a = stats(Tensor::zeros(&[4], OPTS), Tensor::of_slice(&var1).diag(0));
        let b = stats(Tensor::zeros(&[4], OPTS), Tensor::of_slice(&var2).diag(0));
        let expected: f64 = var1
            .iter()
            .zip(var2.iter())
            .map(|(v1, v2)| (v1.sqrt() - v2.sqrt()).powi(2))
            .sum();
        let dist = frechet_distance(&a, &b).unwrap();
        assert!((dist - expected).abs() < 1e-9, "{} vs {}", dist, expected);
    }

    #[test]
    fn mean_shift_adds_squared_distance() {
        let cov = random_spd(3);
        let a = stats(Tensor::of_slice(&[0., 0., 0.]), cov.copy());
        let b = stats(Tensor::of_slice(&[1., 2., 2.]), cov);
        let dist = frechet_distance(&a, &b).unwrap();
        assert!((dist - 9.).abs() < 1e-8, "dist = {}", dist);
    }

    #[test]
    fn nan_is_reported_as_instability() {
        let a = stats(Tensor::of_slice(&[f64::NAN, 0.]), Tensor::eye(2, OPTS));
        let b = stats(Tensor::of_slice(&[0., 0.]), Tensor::eye(2, OPTS));
        match frechet_distance(&a, &b) {
            Err(FidError::NumericalInstability(_)) => {}
            other => panic!("expected instability, got {:?}", other),
        }
    }

    #[test]
    fn nan_covariance_is_reported_as_instability() {
        let cov = Tensor::of_slice(&[f64::NAN, 0., 0., 1.]).view([2, 2]);
        let a = stats(Tensor::zeros(&[2], OPTS), cov);
        let b = stats(Tensor::zeros(&[2], OPTS), Tensor::eye(2, OPTS));
        match frechet_distance(&a, &b) {
            Err(FidError::NumericalInstability(_)) => {}
            other => panic!("expected instability, got {:?}", other),
        }
    }

    #[test]
    fn scalar_mean_is_a_shape_error() {
        let a = stats(Tensor::from(0.0f64), Tensor::eye(1, OPTS));
        let b = stats(Tensor::zeros(&[1], OPTS), Tensor::eye(1, OPTS));
        assert!(matches!(frechet_distance(&a, &b), Err(FidError::Shape(_))));
        assert!(matches!(frechet_distance(&b, &a), Err(FidError::Shape(_))));
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let a = stats(Tensor::zeros(&[2], OPTS), Tensor::eye(2, OPTS));
        let b = stats(Tensor::zeros(&[3], OPTS), Tensor::eye(3, OPTS));
        assert!(matches!(frechet_distance(&a, &b), Err(FidError::Shape(_))));
    }
}

use crate::error::FidError;
use std::path::Path;
use tch::{Kind, Tensor};

/// Mean and covariance of a Gaussian fitted to feature vectors.
#[derive(Debug)]
pub struct GaussianStats {
    pub mu: Tensor,
    pub cov: Tensor,
}

impl GaussianStats {
    /// Fits the Gaussian to an `[N, D]` feature matrix, one observation per row.
    /// The covariance is the unbiased estimate (N - 1 denominator).
    pub fn from_features(features: &Tensor) -> Result<Self, FidError> {
        let (n, _) = features.size2()?;
        if n < 2 {
            return Err(FidError::InsufficientSamples {
                required: 2,
                available: n,
            });
        }
        let features = features.to_kind(Kind::Double);
        let mu = features.mean_dim(&[0], false, Kind::Double);
        let centered = &features - &mu;
        let cov = centered.tr().mm(&centered) / (n - 1) as f64;
        Ok(Self { mu, cov })
    }

    /// Feature dimension `D`, checking that `mu` is `[D]` and `cov` is `[D, D]`.
    pub fn dim(&self) -> Result<i64, FidError> {
        match (self.mu.size().as_slice(), self.cov.size().as_slice()) {
            ([d], [rows, cols]) if rows == d && cols == d => Ok(*d),
            (mu, cov) => Err(FidError::Shape(format!(
                "expected mu of shape [D] and cov of shape [D, D], got {:?} and {:?}",
                mu, cov
            ))),
        }
    }

    /// Reads `mu<suffix>` and `cov<suffix>` from an npz archive.
    pub fn read_npz<P: AsRef<Path>>(path: P, suffix: &str) -> Result<Self, FidError> {
        let mut entries = Tensor::read_npz(path.as_ref())?;
        let mut take = |key: String| {
            entries
                .iter()
                .position(|(name, _)| name.trim_end_matches(".npy") == key)
                .map(|i| entries.swap_remove(i).1.to_kind(Kind::Double))
                .ok_or_else(|| {
                    FidError::Shape(format!("{} has no '{}' entry", path.as_ref().display(), key))
                })
        };
        let mu = take(format!("mu{}", suffix))?;
        let cov = take(format!("cov{}", suffix))?;
        let stats = Self { mu, cov };
        stats.dim()?;
        Ok(stats)
    }

    /// Writes the pair under `mu<suffix>` and `cov<suffix>`.
    pub fn write_npz<P: AsRef<Path>>(&self, path: P, suffix: &str) -> Result<(), FidError> {
        Tensor::write_npz(&self.named(suffix), path)?;
        Ok(())
    }

    pub fn named(&self, suffix: &str) -> [(String, &Tensor); 2] {
        [
            (format!("mu{}", suffix), &self.mu),
            (format!("cov{}", suffix), &self.cov),
        ]
    }
}

use crate::{error::FidError, params::Dataset};
use std::path::PathBuf;

pub const DEFAULT_INCEPTION_PATH: &str = "../FID-scores/pt_inception-2015-12-05.pt";

/// Settings shared by every evaluation of a run.
#[derive(Debug, Clone)]
pub struct EvalConfig {
    /// TorchScript export of the classification network.
    pub inception: PathBuf,
    pub num_samples: i64,
    pub batch_size: i64,
    /// Regenerate samples even when cached ones exist.
    pub recompute: bool,
    /// Replaces every per-dataset directory with `<root>/<dataset name>`.
    pub data_root: Option<PathBuf>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            inception: PathBuf::from(DEFAULT_INCEPTION_PATH),
            num_samples: 10000,
            batch_size: 100,
            recompute: false,
            data_root: None,
        }
    }
}

impl EvalConfig {
    /// Sample and batch counts must be at least one.
    pub fn validate(&self) -> Result<(), FidError> {
        for (what, value) in [
            ("number of samples", self.num_samples),
            ("batch size", self.batch_size),
        ] {
            if value < 1 {
                return Err(FidError::MissingConfiguration(format!(
                    "{} must be positive, got {}",
                    what, value
                )));
            }
        }
        Ok(())
    }

    pub fn data_dir(&self, dataset: Dataset) -> PathBuf {
        match &self.data_root {
            Some(root) => root.join(dataset.name()),
            None => dataset.default_dir(),
        }
    }

    /// `<data_dir>/<dataset>.fidstats<N>.npz`
    pub fn reference_stats_path(&self, dataset: Dataset) -> PathBuf {
        self.data_dir(dataset)
            .join(format!("{}.fidstats{}.npz", dataset.name(), self.num_samples))
    }
}

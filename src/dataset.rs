use crate::{error::FidError, model::IMG_SIZE};
use std::path::Path;
use tch::{Device, Kind, Tensor};
use tracing::info;

/// Real images of a dataset, kept as loaded: `[N, C, IMG_SIZE, IMG_SIZE]` bytes.
pub struct ImageDataset {
    images: Tensor,
    /// Channels of the images handed out; 1 averages the stored colour planes.
    channels: i64,
}

impl ImageDataset {
    pub fn load(dir: &Path, channels: i64) -> Result<Self, FidError> {
        if !dir.is_dir() {
            return Err(FidError::MissingConfiguration(format!(
                "dataset directory {} not found",
                dir.display()
            )));
        }
        let images = tch::vision::image::load_dir(dir, IMG_SIZE, IMG_SIZE)?;
        info!("loaded dataset: {:?}", images);
        Ok(Self::from_tensor(images, channels))
    }

    pub fn from_tensor(images: Tensor, channels: i64) -> Self {
        Self { images, channels }
    }

    pub fn num_points(&self) -> i64 {
        self.images.size()[0]
    }

    /// `count` distinct random images with values in [0, 1].
    pub fn sample(&self, count: i64) -> Result<Tensor, FidError> {
        if count < 1 {
            return Err(FidError::MissingConfiguration(format!(
                "number of samples must be positive, got {}",
                count
            )));
        }
        let available = self.num_points();
        if count > available {
            return Err(FidError::InsufficientSamples {
                required: count,
                available,
            });
        }
        let index = Tensor::randperm(available, (Kind::Int64, Device::Cpu)).narrow(0, 0, count);
        let images = self.images.index_select(0, &index).to_kind(Kind::Float);
        let images = if self.channels == 1 {
            images.mean_dim(&[1], true, Kind::Float)
        } else {
            images
        };
        Ok(images / 255.)
    }
}

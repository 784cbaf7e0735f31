use crate::error::FidError;
use std::path::Path;
use tch::{CModule, Device, Kind, Tensor};
use tracing::{debug, info, warn};

/// Number of channels the classification network takes.
const NETWORK_CHANNELS: i64 = 3;

/// A frozen network returning one pooled feature vector per image.
pub trait FeatureNetwork {
    /// `batch` is `[B, 3, H, W]` with values in [0, 255].
    fn pool_features(&self, batch: &Tensor) -> Result<Tensor, FidError>;
}

/// Inception v3 exported as TorchScript, returning the pool_3 activations.
pub struct InceptionNet {
    module: CModule,
}

impl InceptionNet {
    pub fn load(path: &Path, device: Device) -> Result<Self, FidError> {
        if !path.is_file() {
            return Err(FidError::MissingConfiguration(format!(
                "inception network not found at {}",
                path.display()
            )));
        }
        let module = CModule::load_on_device(path, device)?;
        info!("loaded inception network from {}", path.display());
        Ok(Self { module })
    }
}

impl FeatureNetwork for InceptionNet {
    fn pool_features(&self, batch: &Tensor) -> Result<Tensor, FidError> {
        Ok(self.module.forward_ts(&[batch])?)
    }
}

/// Owns the loaded network for as long as features are being extracted.
///
/// The network always receives batches of exactly `batch_size` images. Dropping the
/// context releases the network.
pub struct ExtractionContext<N = InceptionNet> {
    network: N,
    batch_size: i64,
    device: Device,
}

impl ExtractionContext<InceptionNet> {
    pub fn open(path: &Path, batch_size: i64, device: Device) -> Result<Self, FidError> {
        Self::new(InceptionNet::load(path, device)?, batch_size, device)
    }
}

impl<N: FeatureNetwork> ExtractionContext<N> {
    pub fn new(network: N, batch_size: i64, device: Device) -> Result<Self, FidError> {
        if batch_size < 1 {
            return Err(FidError::MissingConfiguration(format!(
                "batch size must be positive, got {}",
                batch_size
            )));
        }
        debug!(batch_size, "extraction context ready");
        Ok(Self {
            network,
            batch_size,
            device,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Runs `[N, C, H, W]` images in [0, 1] through the network, returning `[M, D]` on
    /// the CPU in single precision.
    ///
    /// Only whole batches are scored: `M = floor(N / batch_size) * batch_size`, and the
    /// trailing images are dropped.
    pub fn extract_features(&self, images: &Tensor) -> Result<Tensor, FidError> {
        let n = images.size()[0];
        let batches = n / self.batch_size;
        if batches == 0 {
            return Err(FidError::InsufficientSamples {
                required: self.batch_size,
                available: n,
            });
        }
        let dropped = n - batches * self.batch_size;
        if dropped > 0 {
            warn!(
                "{} of {} images do not fill a batch of {} and are not scored",
                dropped, n, self.batch_size
            );
        }

        let pb = indicatif::ProgressBar::new(batches as u64);
        let mut features = Vec::with_capacity(batches as usize);
        for index in 0..batches {
            pb.set_position(index as u64);
            let batch = images
                .narrow(0, index * self.batch_size, self.batch_size)
                .to_device(self.device)
                .to_kind(Kind::Float)
                * 255.;
            let batch = to_network_channels(batch)?;
            let pooled = tch::no_grad(|| self.network.pool_features(&batch))?;
            features.push(
                pooled
                    .reshape(&[self.batch_size, -1])
                    .to_kind(Kind::Float)
                    .to_device(Device::Cpu),
            );
        }
        pb.finish_and_clear();
        Ok(Tensor::cat(&features, 0))
    }
}

impl<N> Drop for ExtractionContext<N> {
    fn drop(&mut self) {
        debug!("releasing extraction context");
    }
}

fn to_network_channels(batch: Tensor) -> Result<Tensor, FidError> {
    match batch.size().as_slice() {
        [_, 1, _, _] => Ok(batch.repeat(&[1, NETWORK_CHANNELS, 1, 1])),
        [_, NETWORK_CHANNELS, _, _] => Ok(batch),
        shape => Err(FidError::Shape(format!(
            "expected [N, 1 or 3, H, W] images, got {:?}",
            shape
        ))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Average of each channel, standing in for pool_3.
    pub(crate) struct ChannelMeans;

    impl FeatureNetwork for ChannelMeans {
        fn pool_features(&self, batch: &Tensor) -> Result<Tensor, FidError> {
            Ok(batch.mean_dim(&[2, 3], false, Kind::Float))
        }
    }

    pub(crate) fn context(batch_size: i64) -> ExtractionContext<ChannelMeans> {
        ExtractionContext::new(ChannelMeans, batch_size, Device::Cpu).unwrap()
    }

    #[test]
    fn partial_batch_is_dropped() {
        let images = Tensor::rand(&[37, 3, 8, 8], (Kind::Float, Device::Cpu));
        let features = context(10).extract_features(&images).unwrap();
        assert_eq!(features.size(), [30, 3]);
    }

    #[test]
    fn rows_follow_input_order() {
        let images = Tensor::rand(&[20, 3, 4, 4], (Kind::Float, Device::Cpu));
        let features = context(5).extract_features(&images).unwrap();
        let expected = images.mean_dim(&[2, 3], false, Kind::Float) * 255.;
        assert!(features.allclose(&expected, 1e-4, 1e-3, false));
    }

    #[test]
    fn grayscale_is_expanded_and_rescaled() {
        let images = Tensor::ones(&[4, 1, 6, 6], (Kind::Float, Device::Cpu));
        let features = context(2).extract_features(&images).unwrap();
        assert_eq!(features.size(), [4, 3]);
        assert!((features.min().double_value(&[]) - 255.).abs() < 1e-4);
    }

    #[test]
    fn fewer_images_than_a_batch_is_an_error() {
        let images = Tensor::rand(&[7, 3, 4, 4], (Kind::Float, Device::Cpu));
        assert!(matches!(
            context(10).extract_features(&images),
            Err(FidError::InsufficientSamples { required: 10, available: 7 })
        ));
    }

    #[test]
    fn wrong_channel_count_is_rejected() {
        let images = Tensor::rand(&[4, 2, 4, 4], (Kind::Float, Device::Cpu));
        assert!(matches!(
            context(2).extract_features(&images),
            Err(FidError::Shape(_))
        ));
    }

    #[test]
    fn missing_network_file_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ExtractionContext::open(&dir.path().join("inception.pt"), 10, Device::Cpu);
        assert!(matches!(result, Err(FidError::MissingConfiguration(_))));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(ExtractionContext::new(ChannelMeans, 0, Device::Cpu).is_err());
    }
}

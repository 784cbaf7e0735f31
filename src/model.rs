use crate::{error::FidError, params::ModelParams};
use std::path::Path;
use tch::{nn, Device, Kind, Tensor};
use tracing::info;

pub const IMG_SIZE: i64 = 64;

/// Variables of the variational head share this prefix inside a checkpoint.
const LOG_SIGMA_PREFIX: &str = "encoder.log_sigma.";

fn tr2d(p: nn::Path, c_in: i64, c_out: i64, padding: i64, stride: i64) -> nn::ConvTranspose2D {
    let cfg = nn::ConvTransposeConfig {
        stride,
        padding,
        bias: false,
        ..Default::default()
    };
    nn::conv_transpose2d(p, c_in, c_out, 4, cfg)
}

fn conv2d(p: nn::Path, c_in: i64, c_out: i64, padding: i64, stride: i64) -> nn::Conv2D {
    let cfg = nn::ConvConfig {
        stride,
        padding,
        bias: false,
        ..Default::default()
    };
    nn::conv2d(p, c_in, c_out, 4, cfg)
}

/// Latent `[N, zdim, 1, 1]` to `[N, channels, 64, 64]`.
fn decoder(root: &nn::Path, zdim: i64, channels: i64, symmetric: bool) -> nn::SequentialT {
    let seq = nn::seq_t()
        .add(tr2d(root / "tr1", zdim, 1024, 0, 1))
        .add(nn::batch_norm2d(root / "bn1", 1024, Default::default()))
        .add_fn(Tensor::relu)
        .add(tr2d(root / "tr2", 1024, 512, 1, 2))
        .add(nn::batch_norm2d(root / "bn2", 512, Default::default()))
        .add_fn(Tensor::relu)
        .add(tr2d(root / "tr3", 512, 256, 1, 2))
        .add(nn::batch_norm2d(root / "bn3", 256, Default::default()))
        .add_fn(Tensor::relu)
        .add(tr2d(root / "tr4", 256, 128, 1, 2))
        .add(nn::batch_norm2d(root / "bn4", 128, Default::default()))
        .add_fn(Tensor::relu)
        .add(tr2d(root / "tr5", 128, channels, 1, 2));
    if symmetric {
        seq.add_fn(Tensor::tanh)
    } else {
        seq.add_fn(Tensor::sigmoid)
    }
}

fn leaky_relu(v: f64) -> impl Fn(&Tensor) -> Tensor + Send + 'static {
    move |x| x.maximum(&(x * v))
}

/// `[N, channels, 64, 64]` to `[N, 1024, 4, 4]`.
fn encoder_trunk(root: &nn::Path, channels: i64) -> nn::SequentialT {
    nn::seq_t()
        .add(conv2d(root / "conv1", channels, 128, 1, 2))
        .add_fn(leaky_relu(0.2))
        .add(conv2d(root / "conv2", 128, 256, 1, 2))
        .add(nn::batch_norm2d(root / "bn2", 256, Default::default()))
        .add_fn(leaky_relu(0.2))
        .add(conv2d(root / "conv3", 256, 512, 1, 2))
        .add(nn::batch_norm2d(root / "bn3", 512, Default::default()))
        .add_fn(leaky_relu(0.2))
        .add(conv2d(root / "conv4", 512, 1024, 1, 2))
        .add(nn::batch_norm2d(root / "bn4", 1024, Default::default()))
        .add_fn(leaky_relu(0.2))
}

/// Whether the encoder is a plain autoencoder or a VAE with a log-sigma head.
#[derive(Debug)]
pub enum EncoderKind {
    Deterministic,
    Variational(nn::Conv2D),
}

impl EncoderKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Deterministic => "deterministic",
            Self::Variational(_) => "variational",
        }
    }
}

pub struct Encoder {
    trunk: nn::SequentialT,
    mean: nn::Conv2D,
    kind: EncoderKind,
    zdim: i64,
}

impl Encoder {
    fn new(root: &nn::Path, channels: i64, zdim: i64, variational: bool) -> Self {
        let kind = if variational {
            EncoderKind::Variational(conv2d(root / "log_sigma", 1024, zdim, 0, 1))
        } else {
            EncoderKind::Deterministic
        };
        Self {
            trunk: encoder_trunk(&(root / "trunk"), channels),
            mean: conv2d(root / "mean", 1024, zdim, 0, 1),
            kind,
            zdim,
        }
    }

    /// Latent code of each image. VAE codes are `mean + exp(log_sigma / 2) * noise`.
    fn encode(&self, xs: &Tensor, noise: &Tensor) -> Tensor {
        let h = xs.apply_t(&self.trunk, false);
        let mean = h.apply(&self.mean).view([-1, self.zdim]);
        match &self.kind {
            EncoderKind::Deterministic => mean,
            EncoderKind::Variational(log_sigma) => {
                let log_sigma = h.apply(log_sigma).view([-1, self.zdim]);
                mean + (log_sigma / 2.).exp() * noise
            }
        }
    }
}

/// A trained autoencoder restored from a VarStore checkpoint.
pub struct GenerativeModel {
    vs: nn::VarStore,
    decoder: nn::SequentialT,
    encoder: Encoder,
    params: ModelParams,
}

impl GenerativeModel {
    pub fn new(params: &ModelParams, variational: bool, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let channels = params.dataset.channels();
        let decoder = decoder(
            &(vs.root() / "decoder"),
            params.zdim,
            channels,
            params.input_normalize_sym,
        );
        let encoder = Encoder::new(&(vs.root() / "encoder"), channels, params.zdim, variational);
        Self {
            vs,
            decoder,
            encoder,
            params: params.clone(),
        }
    }

    /// Restores a checkpoint; the encoder kind is read off the stored variable names.
    pub fn load(checkpoint: &Path, params: &ModelParams, device: Device) -> Result<Self, FidError> {
        let variational = Tensor::load_multi(checkpoint)?
            .iter()
            .any(|(name, _)| name.starts_with(LOG_SIGMA_PREFIX));
        let mut model = Self::new(params, variational, device);
        model.vs.load(checkpoint)?;
        model.vs.freeze();
        info!(
            "restored {} model from {}",
            model.encoder_kind().name(),
            checkpoint.display()
        );
        Ok(model)
    }

    pub fn encoder_kind(&self) -> &EncoderKind {
        &self.encoder.kind
    }

    fn decode(&self, zs: &Tensor) -> Tensor {
        zs.view([-1, self.params.zdim, 1, 1]).apply_t(&self.decoder, false)
    }

    /// Generates `num_samples` images from the prior and reconstructs the first
    /// `num_samples` of `to_reconstruct`, both in whole batches of `batch_size`.
    ///
    /// Inputs and outputs follow the model's pixel convention; outputs are on the CPU.
    pub fn run(
        &self,
        num_samples: i64,
        to_reconstruct: &Tensor,
        batch_size: i64,
    ) -> Result<(Tensor, Tensor), FidError> {
        if batch_size < 1 || num_samples < batch_size {
            return Err(FidError::SampleGeneration(format!(
                "{} samples do not fill a batch of {}",
                num_samples, batch_size
            )));
        }
        if to_reconstruct.size()[0] < num_samples {
            return Err(FidError::SampleGeneration(format!(
                "{} images to reconstruct, {} requested",
                to_reconstruct.size()[0],
                num_samples
            )));
        }
        let batches = num_samples / batch_size;
        let device = self.vs.device();
        let z = self.params.pz.sample(num_samples, self.params.zdim, device) * self.params.pz_scale;

        let pb = indicatif::ProgressBar::new(2 * batches as u64);
        let mut samples = Vec::with_capacity(batches as usize);
        let mut reconstructions = Vec::with_capacity(batches as usize);
        tch::no_grad(|| {
            for index in 0..batches {
                pb.set_position(index as u64);
                let zs = z.narrow(0, index * batch_size, batch_size);
                samples.push(self.decode(&zs).to_device(Device::Cpu));
            }
            for index in 0..batches {
                pb.set_position((batches + index) as u64);
                let xs = to_reconstruct
                    .narrow(0, index * batch_size, batch_size)
                    .to_device(device)
                    .to_kind(Kind::Float);
                let noise = z.narrow(0, index * batch_size, batch_size);
                let codes = self.encoder.encode(&xs, &noise);
                reconstructions.push(self.decode(&codes).to_device(Device::Cpu));
            }
        });
        pb.finish_and_clear();

        let samples = Tensor::cat(&samples, 0);
        let reconstructions = Tensor::cat(&reconstructions, 0);
        for (what, images) in [("samples", &samples), ("reconstructions", &reconstructions)] {
            if has_nan(images) {
                return Err(FidError::SampleGeneration(format!("{} contain NaN", what)));
            }
        }
        Ok((samples, reconstructions))
    }
}

fn has_nan(t: &Tensor) -> bool {
    t.isnan().any().int64_value(&[]) != 0
}

// Generate a 2D matrix of images from a tensor with multiple images in [0, 1].
pub fn image_matrix(imgs: &Tensor, sz: i64) -> Tensor {
    let imgs = (imgs * 255.).clamp(0., 255.).to_kind(Kind::Uint8);
    let mut ys = Vec::new();
    for i in 0..sz {
        ys.push(Tensor::cat(
            &(0..sz)
                .map(|j| imgs.narrow(0, sz * i + j, 1))
                .collect::<Vec<_>>(),
            2,
        ));
    }
    Tensor::cat(&ys, 3).squeeze_dim(0)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::params::{Dataset, Prior};

    /// Writes a freshly initialised model as a checkpoint.
    pub(crate) fn save_untrained(params: &ModelParams, variational: bool, path: &Path) {
        GenerativeModel::new(params, variational, Device::Cpu)
            .vs
            .save(path)
            .unwrap();
    }

    fn params(dataset: Dataset, symmetric: bool) -> ModelParams {
        ModelParams {
            dataset,
            zdim: 8,
            pz: Prior::Normal,
            pz_scale: 1.0,
            input_normalize_sym: symmetric,
        }
    }

    #[test]
    fn encoder_kind_is_read_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let params = params(Dataset::Cifar10, true);
        for variational in [false, true] {
            let path = dir.path().join(format!("model-{}.ot", variational));
            save_untrained(&params, variational, &path);
            let model = GenerativeModel::load(&path, &params, Device::Cpu).unwrap();
            assert_eq!(
                matches!(model.encoder_kind(), EncoderKind::Variational(_)),
                variational
            );
        }
    }

    #[test]
    fn missing_checkpoint_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let params = params(Dataset::Mnist, false);
        assert!(GenerativeModel::load(&dir.path().join("none.ot"), &params, Device::Cpu).is_err());
    }

    #[test]
    fn run_truncates_to_whole_batches() {
        let params = params(Dataset::Mnist, false);
        let model = GenerativeModel::new(&params, true, Device::Cpu);
        let real = Tensor::rand(&[5, 1, IMG_SIZE, IMG_SIZE], (Kind::Float, Device::Cpu));
        let (samples, reconstructions) = model.run(5, &real, 2).unwrap();
        assert_eq!(samples.size(), [4, 1, IMG_SIZE, IMG_SIZE]);
        assert_eq!(reconstructions.size(), [4, 1, IMG_SIZE, IMG_SIZE]);
        assert!(samples.min().double_value(&[]) >= 0.);
        assert!(samples.max().double_value(&[]) <= 1.);
    }

    #[test]
    fn run_needs_enough_images_to_reconstruct() {
        let params = params(Dataset::Cifar10, true);
        let model = GenerativeModel::new(&params, false, Device::Cpu);
        let real = Tensor::rand(&[2, 3, IMG_SIZE, IMG_SIZE], (Kind::Float, Device::Cpu));
        assert!(matches!(
            model.run(4, &real, 2),
            Err(FidError::SampleGeneration(_))
        ));
    }

    #[test]
    fn zero_log_sigma_head_adds_unit_noise() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut encoder = Encoder::new(&(vs.root() / "encoder"), 1, 8, true);
        if let EncoderKind::Variational(head) = &mut encoder.kind {
            let _ = tch::no_grad(|| head.ws.zero_());
        }
        let xs = Tensor::rand(&[2, 1, IMG_SIZE, IMG_SIZE], (Kind::Float, Device::Cpu));
        let noise = Tensor::randn(&[2, 8], (Kind::Float, Device::Cpu));
        let codes = tch::no_grad(|| encoder.encode(&xs, &noise));
        let mean = tch::no_grad(|| {
            xs.apply_t(&encoder.trunk, false)
                .apply(&encoder.mean)
                .view([-1, 8])
        });
        assert_eq!(codes.size(), [2, 8]);
        assert!(codes.allclose(&(mean + noise), 1e-5, 1e-5, false));
    }

    #[test]
    fn deterministic_encoder_ignores_noise() {
        let vs = nn::VarStore::new(Device::Cpu);
        let encoder = Encoder::new(&(vs.root() / "encoder"), 3, 8, false);
        let xs = Tensor::rand(&[2, 3, IMG_SIZE, IMG_SIZE], (Kind::Float, Device::Cpu));
        let noise = Tensor::randn(&[2, 8], (Kind::Float, Device::Cpu));
        let codes = tch::no_grad(|| encoder.encode(&xs, &noise));
        let again = tch::no_grad(|| encoder.encode(&xs, &(noise * 10.)));
        assert!(codes.allclose(&again, 0., 0., false));
    }

    #[test]
    fn image_matrix_tiles_a_square_grid() {
        let imgs = Tensor::rand(&[4, 3, 8, 8], (Kind::Float, Device::Cpu));
        let matrix = image_matrix(&imgs, 2);
        assert_eq!(matrix.size(), [3, 16, 16]);
        assert_eq!(matrix.kind(), Kind::Uint8);
    }
}

use crate::{
    config::EvalConfig,
    dataset::ImageDataset,
    error::FidError,
    frechet,
    inception::{ExtractionContext, FeatureNetwork},
    model::{self, GenerativeModel},
    params::{Dataset, ModelParams},
    sharpness,
    stats::GaussianStats,
};
use std::path::{Path, PathBuf};
use tch::{Device, Kind, Tensor};
use tracing::{error, info, warn};

/// Sharpness is only measured on this many images of each set.
const SHARPNESS_SUBSAMPLE: i64 = 500;
const PREVIEW_GRID: i64 = 4;

/// A trained model: its experiment directory (holding `params.txt`) and checkpoint file.
#[derive(Debug, Clone)]
pub struct EvalTarget {
    pub exp_dir: PathBuf,
    pub checkpoint: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FidScores {
    pub generated: f64,
    /// Absent when only cached samples were available.
    pub reconstructed: Option<f64>,
}

/// Files cached next to a checkpoint for a given number of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactPaths {
    pub samples: PathBuf,
    pub reconstructions: PathBuf,
    pub sharpness: PathBuf,
    pub fid_stats: PathBuf,
    pub preview: PathBuf,
}

impl ArtifactPaths {
    pub fn new(checkpoint: &Path, num_samples: i64) -> Self {
        let name = checkpoint
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let artifact = |kind: &str, ext: &str| {
            checkpoint.with_file_name(format!("{}.{}{}.{}", name, kind, num_samples, ext))
        };
        Self {
            samples: artifact("samples", "npy"),
            reconstructions: artifact("reconstr", "npy"),
            sharpness: artifact("sharp", "npz"),
            fid_stats: artifact("fidstats", "npz"),
            preview: artifact("samples", "png"),
        }
    }
}

/// Where the images to score come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleSource {
    Cached,
    /// Reconstructions are not scored.
    SamplesOnly,
    Regenerate,
}

impl SampleSource {
    pub fn resolve(paths: &ArtifactPaths, recompute: bool) -> Self {
        match (recompute, paths.samples.is_file(), paths.reconstructions.is_file()) {
            (false, true, true) => Self::Cached,
            (false, true, false) => Self::SamplesOnly,
            _ => Self::Regenerate,
        }
    }
}

/// Scores together with the statistics they were computed from.
#[derive(Debug)]
pub struct Evaluation {
    pub scores: FidScores,
    pub generated: GaussianStats,
    pub reconstructed: Option<GaussianStats>,
}

/// Evaluates one model. Failures are logged and reported as `None`.
pub fn compute_metrics(config: &EvalConfig, target: &EvalTarget) -> Option<FidScores> {
    let result = config.validate().and_then(|()| {
        let ctx = ExtractionContext::open(
            &config.inception,
            config.batch_size,
            Device::cuda_if_available(),
        )?;
        evaluate_with(config, target, &ctx)
    });
    match result {
        Ok(scores) => Some(scores),
        Err(e) => {
            error!("evaluation of {} failed: {}", target.checkpoint.display(), e);
            None
        }
    }
}

/// Evaluates one model with an already opened extraction context.
///
/// Samples are generated on the context's device.
pub fn evaluate_with<N: FeatureNetwork>(
    config: &EvalConfig,
    target: &EvalTarget,
    ctx: &ExtractionContext<N>,
) -> Result<FidScores, FidError> {
    config.validate()?;
    let params = ModelParams::load(&target.exp_dir)?;
    let reference = read_reference_stats(config, params.dataset)?;
    let paths = ArtifactPaths::new(&target.checkpoint, config.num_samples);

    let (samples, reconstructions) = match SampleSource::resolve(&paths, config.recompute) {
        SampleSource::Cached => {
            info!("samples and reconstructions already available");
            (
                load_images(&paths.samples)?,
                Some(load_images(&paths.reconstructions)?),
            )
        }
        SampleSource::SamplesOnly => {
            info!("samples available but reconstructions are not, evaluating only samples");
            (load_images(&paths.samples)?, None)
        }
        SampleSource::Regenerate => {
            info!("generating samples and reconstructions");
            let (samples, reconstructions) =
                regenerate(config, target, &params, &paths, ctx.device())?;
            (samples, Some(reconstructions))
        }
    };

    let evaluation = score_images(&reference, &samples, reconstructions.as_ref(), ctx)?;
    write_fid_stats(
        &paths.fid_stats,
        &evaluation.generated,
        evaluation.reconstructed.as_ref(),
    )?;
    info!(
        "FID of samples {:.3}, of reconstructions {:?}",
        evaluation.scores.generated, evaluation.scores.reconstructed
    );
    Ok(evaluation.scores)
}

/// Scores samples and, if given, reconstructions with one extraction context.
pub fn score_images<N: FeatureNetwork>(
    reference: &GaussianStats,
    samples: &Tensor,
    reconstructions: Option<&Tensor>,
    ctx: &ExtractionContext<N>,
) -> Result<Evaluation, FidError> {
    info!("computing FID of generated samples");
    let (generated, generated_stats) = fid_from_images(reference, &unit_range(samples), ctx)?;
    let reconstructed = match reconstructions {
        Some(images) => {
            info!("computing FID of reconstructed training images");
            Some(fid_from_images(reference, &unit_range(images), ctx)?)
        }
        None => None,
    };
    Ok(Evaluation {
        scores: FidScores {
            generated,
            reconstructed: reconstructed.as_ref().map(|(dist, _)| *dist),
        },
        generated: generated_stats,
        reconstructed: reconstructed.map(|(_, stats)| stats),
    })
}

/// FID between `reference` and images in [0, 1].
pub fn fid_from_images<N: FeatureNetwork>(
    reference: &GaussianStats,
    images: &Tensor,
    ctx: &ExtractionContext<N>,
) -> Result<(f64, GaussianStats), FidError> {
    let features = ctx.extract_features(images)?;
    let stats = GaussianStats::from_features(&features)?;
    let dist = frechet::frechet_distance(reference, &stats)?;
    Ok((reported_distance(dist), stats))
}

fn reported_distance(dist: f64) -> f64 {
    if dist < 0. {
        warn!("negative distance {:e} treated as numerical noise", dist);
        0.
    } else {
        dist
    }
}

/// Images that still hold negative values are assumed to be in [-1, 1].
fn unit_range(images: &Tensor) -> Tensor {
    if images.numel() > 0 && images.min().double_value(&[]) < 0. {
        warn!("images contain negative values, rescaling from [-1, 1] to [0, 1]");
        (images + 1.) / 2.
    } else {
        images.shallow_clone()
    }
}

fn load_images(path: &Path) -> Result<Tensor, FidError> {
    Ok(channels_first(Tensor::read_npy(path)?))
}

/// Arrays written by channels-last tooling are `[N, H, W, C]`.
fn channels_first(images: Tensor) -> Tensor {
    match images.size().as_slice() {
        [_, c, _, last] if (*last == 1 || *last == 3) && *c != 1 && *c != 3 => {
            images.permute(&[0, 3, 1, 2])
        }
        _ => images,
    }
}

fn regenerate(
    config: &EvalConfig,
    target: &EvalTarget,
    params: &ModelParams,
    paths: &ArtifactPaths,
    device: Device,
) -> Result<(Tensor, Tensor), FidError> {
    let dataset = ImageDataset::load(&config.data_dir(params.dataset), params.dataset.channels())?;
    let to_autoencode = dataset.sample(config.num_samples)?;
    let to_autoencode = if params.input_normalize_sym {
        to_autoencode * 2. - 1.
    } else {
        to_autoencode
    };

    let (samples, reconstructions) = {
        let model = GenerativeModel::load(&target.checkpoint, params, device).map_err(|e| {
            FidError::SampleGeneration(format!(
                "cannot restore {}: {}",
                target.checkpoint.display(),
                e
            ))
        })?;
        model.run(config.num_samples, &to_autoencode, config.batch_size)?
    };
    let (samples, reconstructions) = if params.input_normalize_sym {
        (samples / 2. + 0.5, reconstructions / 2. + 0.5)
    } else {
        (samples, reconstructions)
    };

    let sharp_gen = sharpness_of(&samples);
    let sharp_reconstr = sharpness_of(&reconstructions);
    info!(
        "samples sharpness = {}",
        sharp_gen.mean(Kind::Double).double_value(&[])
    );
    info!(
        "reconstruction sharpness = {}",
        sharp_reconstr.mean(Kind::Double).double_value(&[])
    );

    samples.write_npy(&paths.samples)?;
    reconstructions.write_npy(&paths.reconstructions)?;
    Tensor::write_npz(
        &[("sharp_gen", &sharp_gen), ("sharp_reconstr", &sharp_reconstr)],
        &paths.sharpness,
    )?;
    write_preview(&samples, &paths.preview)?;
    Ok((samples, reconstructions))
}

fn sharpness_of(images: &Tensor) -> Tensor {
    let n = images.size()[0].min(SHARPNESS_SUBSAMPLE);
    sharpness::laplacian_variance(&images.narrow(0, 0, n))
}

fn write_preview(samples: &Tensor, path: &Path) -> Result<(), FidError> {
    let sz = PREVIEW_GRID.min((samples.size()[0] as f64).sqrt() as i64);
    if sz == 0 {
        return Ok(());
    }
    let imgs = samples.narrow(0, 0, sz * sz);
    let imgs = if imgs.size()[1] == 1 {
        imgs.repeat(&[1, 3, 1, 1])
    } else {
        imgs
    };
    tch::vision::image::save(&model::image_matrix(&imgs, sz), path)?;
    Ok(())
}

/// Writes `mu_gen`, `cov_gen` and, when reconstructions were scored, `mu_rec`, `cov_rec`.
pub fn write_fid_stats(
    path: &Path,
    generated: &GaussianStats,
    reconstructed: Option<&GaussianStats>,
) -> Result<(), FidError> {
    let mut entries = generated.named("_gen").to_vec();
    if let Some(stats) = reconstructed {
        entries.extend(stats.named("_rec"));
    }
    Tensor::write_npz(&entries, path)?;
    Ok(())
}

fn read_reference_stats(config: &EvalConfig, dataset: Dataset) -> Result<GaussianStats, FidError> {
    let path = config.reference_stats_path(dataset);
    if !path.is_file() {
        return Err(FidError::MissingReferenceStats(path));
    }
    GaussianStats::read_npz(&path, "")
}

/// Computes the statistics of `num_samples` real images and stores them where
/// evaluations look for them.
pub fn compute_reference_stats(config: &EvalConfig, dataset: Dataset) -> Result<PathBuf, FidError> {
    config.validate()?;
    let images = ImageDataset::load(&config.data_dir(dataset), dataset.channels())?
        .sample(config.num_samples)?;
    let stats = {
        let ctx = ExtractionContext::open(
            &config.inception,
            config.batch_size,
            Device::cuda_if_available(),
        )?;
        GaussianStats::from_features(&ctx.extract_features(&images)?)?
    };
    let path = config.reference_stats_path(dataset);
    stats.write_npz(&path, "")?;
    info!("wrote {} reference statistics to {}", dataset.name(), path.display());
    Ok(path)
}

/// FID between two stored statistics, read under `mu<suffix>` / `cov<suffix>`.
pub fn distance_between(
    a: &Path,
    suffix_a: &str,
    b: &Path,
    suffix_b: &str,
) -> Result<f64, FidError> {
    let a = GaussianStats::read_npz(a, suffix_a)?;
    let b = GaussianStats::read_npz(b, suffix_b)?;
    frechet::frechet_distance(&a, &b)
}

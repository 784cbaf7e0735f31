use crate::error::FidError;
use std::{collections::HashMap, fs, path::Path, path::PathBuf, str::FromStr};
use tch::{Device, Kind, Tensor};

pub const PARAMS_FILE: &str = "params.txt";

/// Datasets the models are trained on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    CelebA,
    Cifar10,
    Dsprites,
    Grassli,
    Mnist,
}

impl Dataset {
    pub fn name(self) -> &'static str {
        match self {
            Self::CelebA => "celebA",
            Self::Cifar10 => "cifar10",
            Self::Dsprites => "dsprites",
            Self::Grassli => "grassli",
            Self::Mnist => "mnist",
        }
    }

    pub fn default_dir(self) -> PathBuf {
        PathBuf::from(match self {
            Self::CelebA => "../celebA/datasets/celeba/img_align_celeba",
            Self::Cifar10 => "../cifar10",
            Self::Dsprites => "../dsprites",
            Self::Grassli => "../grassli",
            Self::Mnist => "../mnist",
        })
    }

    pub fn channels(self) -> i64 {
        match self {
            Self::Mnist | Self::Dsprites => 1,
            _ => 3,
        }
    }
}

impl FromStr for Dataset {
    type Err = FidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "celebA" => Ok(Self::CelebA),
            "cifar10" => Ok(Self::Cifar10),
            "dsprites" => Ok(Self::Dsprites),
            "grassli" => Ok(Self::Grassli),
            "mnist" => Ok(Self::Mnist),
            _ => Err(FidError::InvalidParams(format!("unknown dataset '{}'", s))),
        }
    }
}

/// Latent prior the model was trained with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prior {
    Uniform,
    Normal,
    Sphere,
}

impl Prior {
    /// Draws `[n, zdim]` unscaled latent codes.
    pub fn sample(self, n: i64, zdim: i64, device: Device) -> Tensor {
        match self {
            Self::Uniform => Tensor::rand(&[n, zdim], (Kind::Float, device)) * 2.0 - 1.0,
            Self::Normal => Tensor::randn(&[n, zdim], (Kind::Float, device)),
            Self::Sphere => {
                let noise = Tensor::randn(&[n, zdim], (Kind::Float, device));
                let norm = (&noise * &noise)
                    .sum_dim_intlist(&[1], true, Kind::Float)
                    .sqrt();
                noise / norm
            }
        }
    }
}

impl FromStr for Prior {
    type Err = FidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uniform" => Ok(Self::Uniform),
            "normal" => Ok(Self::Normal),
            "sphere" => Ok(Self::Sphere),
            _ => Err(FidError::InvalidParams(format!("unknown prior '{}'", s))),
        }
    }
}

/// Settings of a trained model, read from its experiment directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    pub dataset: Dataset,
    pub zdim: i64,
    pub pz: Prior,
    pub pz_scale: f64,
    /// Images are in [-1, 1] rather than [0, 1] on the model side.
    pub input_normalize_sym: bool,
}

impl ModelParams {
    pub fn load(exp_dir: &Path) -> Result<Self, FidError> {
        let path = exp_dir.join(PARAMS_FILE);
        if !path.is_file() {
            return Err(FidError::MissingConfiguration(format!(
                "{} does not contain {}",
                exp_dir.display(),
                PARAMS_FILE
            )));
        }
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Parses `key : value` lines; unknown keys are ignored.
    pub fn parse(text: &str) -> Result<Self, FidError> {
        let entries = text
            .lines()
            .filter_map(|line| line.split_once(" : "))
            .map(|(key, value)| (key.trim(), value.trim()))
            .collect::<HashMap<_, _>>();
        let get = |key: &str| {
            entries
                .get(key)
                .copied()
                .ok_or_else(|| FidError::InvalidParams(format!("missing '{}'", key)))
        };
        Ok(Self {
            dataset: get("dataset")?.parse()?,
            zdim: get("zdim")?
                .parse()
                .map_err(|e| invalid_value("zdim", e))?,
            pz: get("pz")?.parse()?,
            pz_scale: get("pz_scale")?
                .parse()
                .map_err(|e| invalid_value("pz_scale", e))?,
            input_normalize_sym: get("input_normalize_sym")? == "True",
        })
    }
}

fn invalid_value(key: &str, e: impl std::fmt::Display) -> FidError {
    FidError::InvalidParams(format!("{}: {}", key, e))
}

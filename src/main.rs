use clap::Parser;
use std::{error::Error, path::PathBuf};

mod config;
mod dataset;
mod error;
mod evaluate;
mod frechet;
mod inception;
mod logging;
mod model;
mod params;
mod sharpness;
mod stats;

#[derive(Parser)]
#[clap(
    name = "fid-eval",
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
)]
struct Entry {
    /// Inception network exported as TorchScript
    #[clap(long, global = true, default_value = config::DEFAULT_INCEPTION_PATH)]
    inception: PathBuf,
    /// Images per feature-extraction batch
    #[clap(long, global = true, default_value = "100")]
    batch_size: i64,
    /// Number of images to score
    #[clap(long, global = true, default_value = "10000")]
    num_samples: i64,
    /// Root holding one directory per dataset, replacing the default locations
    #[clap(long, global = true)]
    data_root: Option<PathBuf>,
    /// Random seed
    #[clap(long, global = true)]
    seed: Option<i64>,
    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(clap::Subcommand)]
enum Subcommand {
    /// Score the samples and reconstructions of a trained model
    Eval {
        /// Experiment directory containing params.txt
        exp_dir: PathBuf,
        /// Model checkpoint
        checkpoint: PathBuf,
        /// Regenerate samples even if cached ones exist
        #[clap(long)]
        recompute: bool,
    },
    /// Compute reference statistics of a dataset
    Stats {
        /// Dataset name (celebA, cifar10, dsprites, grassli, mnist)
        dataset: params::Dataset,
    },
    /// Distance between two statistics files
    Distance {
        a: PathBuf,
        b: PathBuf,
        /// Key suffix in the first file, e.g. "_gen"
        #[clap(long, default_value = "")]
        suffix_a: String,
        /// Key suffix in the second file
        #[clap(long, default_value = "")]
        suffix_b: String,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    logging::init_tracing();
    let args = Entry::parse();
    if let Some(seed) = args.seed {
        tch::manual_seed(seed);
    }
    let mut config = config::EvalConfig {
        inception: args.inception,
        num_samples: args.num_samples,
        batch_size: args.batch_size,
        recompute: false,
        data_root: args.data_root,
    };
    config.validate()?;
    match args.subcommand {
        Subcommand::Eval {
            exp_dir,
            checkpoint,
            recompute,
        } => {
            config.recompute = recompute;
            let target = evaluate::EvalTarget {
                exp_dir,
                checkpoint,
            };
            match evaluate::compute_metrics(&config, &target) {
                Some(scores) => {
                    match scores.reconstructed {
                        Some(rec) => println!("fid_gen={} fid_rec={}", scores.generated, rec),
                        None => println!("fid_gen={}", scores.generated),
                    }
                    Ok(())
                }
                None => Err("FID computation failed".into()),
            }
        }
        Subcommand::Stats { dataset } => {
            let path = evaluate::compute_reference_stats(&config, dataset)?;
            println!("{}", path.display());
            Ok(())
        }
        Subcommand::Distance {
            a,
            b,
            suffix_a,
            suffix_b,
        } => {
            let dist = evaluate::distance_between(&a, &suffix_a, &b, &suffix_b)?;
            println!("{}", dist);
            Ok(())
        }
    }
}

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use tch::{nn, nn::OptimizerConfig, Device, Kind, Tensor};
use tracing::info;

use ddpm_rs::{utils, Diffusion, DiffusionConfig, MlpNoisePredictor, NoiseSource, SeededNoise};

/// Centers of the toy training distribution.
const MIXTURE_CENTERS: [[f64; 2]; 4] = [[2.0, 2.0], [-2.0, 2.0], [-2.0, -2.0], [2.0, -2.0]];
const MIXTURE_STD: f64 = 0.3;

#[derive(Parser)]
#[command(name = "ddpm", author, version, long_about = None)]
#[command(about = "Denoising diffusion probabilistic models")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print beta, alpha_bar and SNR for every step of a schedule
    Schedule {
        #[arg(long, short = 'c')]
        config: PathBuf,

        /// Override the number of steps from the config
        #[arg(long)]
        steps: Option<usize>,
    },

    /// Train the reference MLP on a 2D Gaussian mixture
    Train {
        #[arg(long, short = 'c')]
        config: PathBuf,

        /// Where to save the trained weights
        #[arg(long, short = 'o')]
        output: PathBuf,

        #[arg(long, default_value_t = 2000)]
        iterations: usize,

        #[arg(long, default_value_t = 256)]
        batch_size: usize,

        #[arg(long, default_value_t = 1e-3)]
        learning_rate: f64,

        #[arg(long, default_value_t = 9527)]
        seed: u64,
    },

    /// Generate samples with trained weights
    Sample {
        #[arg(long, short = 'c')]
        config: PathBuf,

        #[arg(long, short = 'w')]
        weights: PathBuf,

        #[arg(long, default_value_t = 1000)]
        num_samples: usize,

        /// Omit for a random seed each run.
        #[arg(long, short = 's')]
        seed: Option<u64>,

        /// Keep every intermediate state and report per-step statistics
        #[arg(long)]
        trajectory: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Schedule { config, steps } => schedule(config, steps),
        Commands::Train { config, output, iterations, batch_size, learning_rate, seed } => {
            train(config, output, iterations, batch_size, learning_rate, seed)
        }
        Commands::Sample { config, weights, num_samples, seed, trajectory } => {
            sample(config, weights, num_samples, seed, trajectory)
        }
    }
}

fn schedule(config: PathBuf, steps: Option<usize>) -> Result<()> {
    let mut cfg = DiffusionConfig::from_file(&config)?;
    if let Some(steps) = steps {
        cfg.num_steps = steps;
    }
    let diffusion = Diffusion::new(&cfg)?;
    let coeffs = diffusion.coefficients();
    let snr = coeffs.snr();
    println!("{:>6} {:>12} {:>12} {:>12}", "t", "beta", "alpha_bar", "snr");
    for t in 1..=coeffs.num_steps() {
        println!(
            "{:>6} {:>12.6e} {:>12.6e} {:>12.6e}",
            t,
            coeffs.beta(t),
            coeffs.alpha_bar(t),
            snr[t - 1]
        );
    }
    Ok(())
}

/// A batch from the four-component mixture, shape `(batch_size, 2)`.
fn mixture_batch(rng: &mut ChaCha8Rng, batch_size: usize, device: Device) -> Tensor {
    let mut values = Vec::with_capacity(batch_size * 2);
    for _ in 0..batch_size {
        let center = MIXTURE_CENTERS[rng.gen_range(0..MIXTURE_CENTERS.len())];
        for c in center {
            let jitter: f64 = rng.sample(StandardNormal);
            values.push(c + MIXTURE_STD * jitter);
        }
    }
    Tensor::from_slice(&values).view([batch_size as i64, 2]).to_kind(Kind::Float).to_device(device)
}

fn train(
    config: PathBuf,
    output: PathBuf,
    iterations: usize,
    batch_size: usize,
    learning_rate: f64,
    seed: u64,
) -> Result<()> {
    let cfg = DiffusionConfig::from_file(&config)?;
    if cfg.sample_shape != [2] {
        bail!("the toy dataset is two-dimensional, got sample_shape {:?}", cfg.sample_shape);
    }
    if batch_size < 1 {
        bail!("batch size must be at least 1");
    }
    let diffusion = Diffusion::new(&cfg)?;
    let device = utils::get_device();
    info!("Using device: {:?}", device);

    tch::manual_seed(seed as i64);
    let vs = nn::VarStore::new(device);
    let model = MlpNoisePredictor::new(vs.root(), &cfg.sample_shape, cfg.model.clone())?;
    let mut opt = nn::Adam::default().build(&vs, learning_rate)?;

    let mut data_rng = ChaCha8Rng::seed_from_u64(seed);
    let mut noise = SeededNoise::new(seed.wrapping_add(1));
    let log_every = (iterations / 10).max(1);
    let mut running = 0.0;
    for iteration in 1..=iterations {
        let x_0 = mixture_batch(&mut data_rng, batch_size, device);
        let loss = diffusion.compute_loss(&x_0, &model, &mut noise)?;
        opt.backward_step(&loss);
        running += loss.double_value(&[]);
        if iteration % log_every == 0 {
            let mean_loss = running / log_every as f64;
            info!("Iteration {:>6}/{} | Loss: {:.6}", iteration, iterations, mean_loss);
            running = 0.0;
        }
    }

    vs.save(&output)?;
    info!("Model saved to: {}", output.display());
    Ok(())
}

fn sample(
    config: PathBuf,
    weights: PathBuf,
    num_samples: usize,
    seed: Option<u64>,
    trajectory: bool,
) -> Result<()> {
    let cfg = DiffusionConfig::from_file(&config)?;
    let diffusion = Diffusion::new(&cfg)?;
    let device = utils::get_device();

    let mut vs = nn::VarStore::new(device);
    let model = MlpNoisePredictor::new(vs.root(), &cfg.sample_shape, cfg.model.clone())?;
    vs.load(&weights)?;
    info!("Loaded weights from: {}", weights.display());

    let mut noise = match seed {
        Some(seed) => SeededNoise::new(seed),
        None => SeededNoise::from_entropy(),
    };
    let options = (Kind::Float, device);
    let samples = tch::no_grad(|| -> Result<Tensor> {
        if !trajectory {
            return Ok(diffusion.generate(num_samples, options, &model, &mut noise)?);
        }
        let mut size = vec![num_samples as i64];
        size.extend_from_slice(diffusion.sample_shape());
        let x_t = noise.standard_normal(&size, options)?;
        let states = diffusion.denoise_all_steps(&x_t, &model, &mut noise)?;
        info!("Trajectory holds {} states", states.len());
        let stride = (states.num_steps() / 10).max(1);
        for t in (0..states.len()).rev().step_by(stride) {
            let std = states[t].to_kind(Kind::Double).std(true).double_value(&[]);
            println!("t={t:>6} std={std:.4}");
        }
        Ok(states[0].shallow_clone())
    })?;

    let flat = samples.to_kind(Kind::Double).view([num_samples as i64, -1]);
    let mean = Vec::<f64>::try_from(&flat.mean_dim(Some([0i64].as_slice()), false, Kind::Double))?;
    let std = Vec::<f64>::try_from(&flat.std_dim(Some([0i64].as_slice()), true, false))?;
    info!("Generated {} samples of shape {:?}", num_samples, diffusion.sample_shape());
    for (i, (m, s)) in mean.iter().zip(&std).enumerate() {
        println!("feature {i}: mean={m:.4} std={s:.4}");
    }
    let non_finite = utils::count_non_finite(&samples)?;
    if non_finite > 0 {
        bail!("{non_finite} generated values are not finite");
    }
    Ok(())
}

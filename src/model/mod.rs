//! A small reference noise predictor: an MLP over flattened samples with a
//! sinusoidal step embedding.
use serde::{Deserialize, Serialize};
use tch::{
    nn::{self, Module},
    Kind, Tensor,
};

use crate::error::{DiffusionError, Result};
use crate::predictor::NoisePredictor;
use crate::utils::check_sample;

mod activation;
pub use activation::Activation;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlpConfig {
    pub hidden_dim: i64,
    pub depth: usize,
    /// Width of the sinusoidal embedding; must be even and at least 4.
    pub time_dim: i64,
    pub activation: Activation,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self { hidden_dim: 128, depth: 3, time_dim: 32, activation: Activation::Silu }
    }
}

/// `emb[i] = sin(t * f_i)` for the first half and `cos(t * f_i)` for the second,
/// with `f_i = exp(-ln(10000) * i / (half - 1))`.
pub fn sinusoidal_embedding(t: &Tensor, dim: i64) -> Tensor {
    let half_dim = dim / 2;
    let scale = -(10000f64.ln()) / (half_dim - 1) as f64;
    let freqs = (Tensor::arange(half_dim, (Kind::Float, t.device())) * scale).exp();
    let args = t.to_kind(Kind::Float).unsqueeze(-1) * freqs.unsqueeze(0);
    Tensor::cat(&[args.sin(), args.cos()], -1)
}

#[derive(Debug)]
struct TimeEmbedding {
    linear_1: nn::Linear,
    linear_2: nn::Linear,
    activation: Activation,
    time_dim: i64,
}

impl TimeEmbedding {
    fn new(vs: nn::Path, time_dim: i64, hidden_dim: i64, activation: Activation) -> Self {
        let linear_1 = nn::linear(&vs / "linear_1", time_dim, hidden_dim, Default::default());
        let linear_2 = nn::linear(&vs / "linear_2", hidden_dim, hidden_dim, Default::default());
        Self { linear_1, linear_2, activation, time_dim }
    }
}

impl Module for TimeEmbedding {
    fn forward(&self, t: &Tensor) -> Tensor {
        let emb = sinusoidal_embedding(t, self.time_dim);
        let emb = self.activation.forward(&self.linear_1.forward(&emb));
        self.linear_2.forward(&emb)
    }
}

#[derive(Debug)]
pub struct MlpNoisePredictor {
    time_embedding: TimeEmbedding,
    input_proj: nn::Linear,
    layers: Vec<nn::Linear>,
    output_proj: nn::Linear,
    sample_shape: Vec<i64>,
    config: MlpConfig,
}

impl MlpNoisePredictor {
    /// Registers the parameters under `vs`; `sample_shape` is the per-example
    /// shape, flattened internally.
    pub fn new(vs: nn::Path, sample_shape: &[i64], config: MlpConfig) -> Result<Self> {
        if sample_shape.is_empty() || sample_shape.iter().any(|d| *d < 1) {
            return Err(DiffusionError::config(format!("invalid sample shape {sample_shape:?}")));
        }
        if config.hidden_dim < 1 {
            return Err(DiffusionError::config(format!(
                "hidden_dim must be positive, got {}",
                config.hidden_dim
            )));
        }
        if config.time_dim < 4 || config.time_dim % 2 != 0 {
            return Err(DiffusionError::config(format!(
                "time_dim must be even and at least 4, got {}",
                config.time_dim
            )));
        }
        let in_dim: i64 = sample_shape.iter().product();
        let time_embedding = TimeEmbedding::new(
            &vs / "time_embedding",
            config.time_dim,
            config.hidden_dim,
            config.activation,
        );
        let hidden_dim = config.hidden_dim;
        let input_proj = nn::linear(&vs / "input_proj", in_dim, hidden_dim, Default::default());
        let vs_layers = &vs / "layers";
        let layers = (0..config.depth)
            .map(|i| nn::linear(&vs_layers / i, hidden_dim, hidden_dim, Default::default()))
            .collect();
        let output_proj = nn::linear(&vs / "output_proj", hidden_dim, in_dim, Default::default());
        Ok(Self {
            time_embedding,
            input_proj,
            layers,
            output_proj,
            sample_shape: sample_shape.to_vec(),
            config,
        })
    }

    pub fn config(&self) -> &MlpConfig {
        &self.config
    }

    pub fn forward(&self, x_t: &Tensor, t: &Tensor) -> Tensor {
        let size = x_t.size();
        let xs = x_t.to_kind(Kind::Float).view([size[0], -1]);
        let mut h = self.input_proj.forward(&xs) + self.time_embedding.forward(t);
        for layer in &self.layers {
            h = &h + self.config.activation.forward(&layer.forward(&h));
        }
        self.output_proj
            .forward(&self.config.activation.forward(&h))
            .view(size.as_slice())
            .to_kind(x_t.kind())
    }
}

impl NoisePredictor for MlpNoisePredictor {
    fn predict(&self, x_t: &Tensor, t: &Tensor) -> Result<Tensor> {
        check_sample(x_t, Some(&self.sample_shape))?;
        if t.size() != [x_t.size()[0]] {
            return Err(DiffusionError::shape(&[x_t.size()[0]], &t.size()));
        }
        Ok(self.forward(x_t, t))
    }
}

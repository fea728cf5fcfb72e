//! Denoising diffusion probabilistic models on top of `tch`.
//!
//! A [`NoiseSchedule`] fixes the per-step variances, [`DerivedCoefficients`]
//! precomputes everything the processes need, and [`ForwardProcess`],
//! [`TrainingObjective`] and [`ReverseProcess`] share those coefficients
//! through an `Arc`. All randomness is drawn from a caller-owned
//! [`NoiseSource`].
pub mod config;
pub mod diffusion;
pub mod error;
pub mod forward;
pub mod model;
pub mod noise;
pub mod objective;
pub mod predictor;
pub mod reverse;
pub mod schedule;
pub mod trajectory;
pub mod utils;

pub use config::{DiffusionConfig, SamplerConfig};
pub use diffusion::Diffusion;
pub use error::{DiffusionError, Result};
pub use forward::ForwardProcess;
pub use model::{Activation, MlpConfig, MlpNoisePredictor};
pub use noise::{NoiseSource, ScriptedNoise, SeededNoise};
pub use objective::{LossKind, TrainingObjective};
pub use predictor::{FnPredictor, NoisePredictor};
pub use reverse::{Denoise, ReverseProcess, VarianceKind};
pub use schedule::{BetaSchedule, CoefficientTensors, DerivedCoefficients, NoiseSchedule};
pub use trajectory::Trajectory;

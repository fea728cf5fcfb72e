use std::sync::Arc;

use tch::{Device, Kind, Tensor};

use crate::config::DiffusionConfig;
use crate::error::Result;
use crate::forward::ForwardProcess;
use crate::noise::NoiseSource;
use crate::objective::TrainingObjective;
use crate::predictor::NoisePredictor;
use crate::reverse::ReverseProcess;
use crate::schedule::{DerivedCoefficients, NoiseSchedule};
use crate::trajectory::Trajectory;

/// One schedule shared by the forward process, the training objective and the
/// reverse process.
#[derive(Debug, Clone)]
pub struct Diffusion {
    coeffs: Arc<DerivedCoefficients>,
    sample_shape: Vec<i64>,
    forward: ForwardProcess,
    objective: TrainingObjective,
    reverse: ReverseProcess,
}

impl Diffusion {
    pub fn new(config: &DiffusionConfig) -> Result<Self> {
        config.validate()?;
        let schedule = NoiseSchedule::build(config.num_steps, &config.beta_schedule)?;
        let coeffs = Arc::new(DerivedCoefficients::new(schedule)?);
        let sample_shape = config.sample_shape.clone();
        let forward = ForwardProcess::new(coeffs.clone()).with_sample_shape(sample_shape.clone());
        let objective = TrainingObjective::new(coeffs.clone())
            .with_loss(config.objective)
            .with_sample_shape(sample_shape.clone());
        let reverse = ReverseProcess::new(coeffs.clone())
            .with_variance(config.sampler.variance)
            .with_clip_sample(config.sampler.clip_sample)
            .with_sample_shape(sample_shape.clone());
        tracing::debug!(
            num_steps = config.num_steps,
            schedule = config.beta_schedule.name(),
            "built diffusion process"
        );
        Ok(Self { coeffs, sample_shape, forward, objective, reverse })
    }

    pub fn coefficients(&self) -> &Arc<DerivedCoefficients> {
        &self.coeffs
    }

    pub fn num_steps(&self) -> usize {
        self.coeffs.num_steps()
    }

    pub fn sample_shape(&self) -> &[i64] {
        &self.sample_shape
    }

    pub fn forward_process(&self) -> &ForwardProcess {
        &self.forward
    }

    pub fn objective(&self) -> &TrainingObjective {
        &self.objective
    }

    pub fn reverse_process(&self) -> &ReverseProcess {
        &self.reverse
    }

    pub fn diffuse<N>(&self, x_0: &Tensor, t: usize, noise: &mut N) -> Result<Tensor>
    where
        N: NoiseSource + ?Sized,
    {
        self.forward.diffuse(x_0, t, noise)
    }

    pub fn diffuse_all_steps<N>(&self, x_0: &Tensor, noise: &mut N) -> Result<Trajectory>
    where
        N: NoiseSource + ?Sized,
    {
        self.forward.diffuse_all_steps(x_0, noise)
    }

    pub fn compute_loss<P, N>(&self, x_0: &Tensor, predictor: &P, noise: &mut N) -> Result<Tensor>
    where
        P: NoisePredictor + ?Sized,
        N: NoiseSource + ?Sized,
    {
        self.objective.compute_loss(x_0, predictor, noise)
    }

    pub fn denoise_all_steps<P, N>(
        &self,
        x_t: &Tensor,
        predictor: &P,
        noise: &mut N,
    ) -> Result<Trajectory>
    where
        P: NoisePredictor + ?Sized,
        N: NoiseSource + ?Sized,
    {
        self.reverse.denoise_all_steps(x_t, predictor, noise)
    }

    /// `num_samples` draws of the configured sample shape.
    pub fn generate<P, N>(
        &self,
        num_samples: usize,
        options: (Kind, Device),
        predictor: &P,
        noise: &mut N,
    ) -> Result<Tensor>
    where
        P: NoisePredictor + ?Sized,
        N: NoiseSource + ?Sized,
    {
        self.reverse.generate(&self.sample_shape, num_samples, options, predictor, noise)
    }
}

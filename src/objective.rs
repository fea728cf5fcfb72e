//! Simplified DDPM training objective.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tch::{Reduction, Tensor};

use crate::error::{DiffusionError, Result};
use crate::forward::ForwardProcess;
use crate::noise::NoiseSource;
use crate::predictor::{predict_checked, NoisePredictor};
use crate::schedule::DerivedCoefficients;
use crate::utils::{self, check_sample};

/// Discrepancy between injected and predicted noise, averaged over batch and
/// feature dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "loss", rename_all = "snake_case")]
pub enum LossKind {
    #[default]
    Mse,
    L1,
    Huber { delta: f64 },
}

impl LossKind {
    pub fn validate(&self) -> Result<()> {
        match self {
            LossKind::Huber { delta } if !(*delta > 0.0 && delta.is_finite()) => Err(
                DiffusionError::config(format!("huber delta must be positive, got {delta}")),
            ),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainingObjective {
    forward: ForwardProcess,
    loss: LossKind,
}

impl TrainingObjective {
    pub fn new(coeffs: Arc<DerivedCoefficients>) -> Self {
        Self { forward: ForwardProcess::new(coeffs), loss: LossKind::default() }
    }

    pub fn with_loss(mut self, loss: LossKind) -> Self {
        self.loss = loss;
        self
    }

    pub fn with_sample_shape(mut self, shape: Vec<i64>) -> Self {
        self.forward = self.forward.with_sample_shape(shape);
        self
    }

    pub fn loss_kind(&self) -> LossKind {
        self.loss
    }

    /// Draw a step and a noise vector per example, noise the batch and score
    /// the predictor against the injected noise. Returns a 0-dim tensor that
    /// carries the predictor's autograd graph.
    pub fn compute_loss<P, N>(&self, x_0: &Tensor, predictor: &P, noise: &mut N) -> Result<Tensor>
    where
        P: NoisePredictor + ?Sized,
        N: NoiseSource + ?Sized,
    {
        check_sample(x_0, None)?;
        let num_steps = self.forward.coefficients().num_steps();
        let steps = noise.uniform_steps(utils::batch_size(x_0), num_steps)?;
        let eps = noise.randn_like(x_0)?;
        self.compute_loss_at(x_0, &steps, &eps, predictor)
    }

    /// The objective at caller-chosen steps and noise.
    pub fn compute_loss_at<P>(
        &self,
        x_0: &Tensor,
        steps: &[usize],
        eps: &Tensor,
        predictor: &P,
    ) -> Result<Tensor>
    where
        P: NoisePredictor + ?Sized,
    {
        let x_t = self.forward.diffuse_batch(x_0, steps, eps)?;
        let t = utils::step_tensor(steps, x_0.device());
        let predicted = predict_checked(predictor, &x_t, &t)?;
        let loss = match self.loss {
            LossKind::Mse => predicted.f_mse_loss(eps, Reduction::Mean)?,
            LossKind::L1 => predicted.f_l1_loss(eps, Reduction::Mean)?,
            LossKind::Huber { delta } => {
                self.loss.validate()?;
                predicted.f_huber_loss(eps, Reduction::Mean, delta)?
            }
        };
        Ok(loss)
    }
}

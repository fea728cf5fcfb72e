//! Per-step coefficients derived once from a [`NoiseSchedule`].
use tch::{Device, Kind, Tensor};

use super::NoiseSchedule;
use crate::error::{DiffusionError, Result};

/// Alpha, alpha-bar and the square-root/reciprocal transforms consumed by the
/// forward and reverse processes.
///
/// The cumulative product is accumulated in log space and kept there, so that
/// monotonicity is checked on `ln(alpha_bar)` and `sqrt(alpha_bar)` is taken as
/// `exp(ln(alpha_bar) / 2)`; long schedules whose `alpha_bar` underflows `f64`
/// stay valid. `1 - alpha_bar` is taken through `expm1` so it stays accurate
/// while `alpha_bar` is close to 1.
#[derive(Debug, Clone)]
pub struct DerivedCoefficients {
    schedule: NoiseSchedule,
    alphas: Vec<f64>,
    log_alphas_cumprod: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    one_minus_alphas_cumprod: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
    sqrt_recip_alphas: Vec<f64>,
    eps_coefs: Vec<f64>,
    sqrt_betas: Vec<f64>,
    posterior_variance: Vec<f64>,
}

impl DerivedCoefficients {
    pub fn new(schedule: NoiseSchedule) -> Result<Self> {
        let betas = schedule.betas();
        let num_steps = betas.len();

        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();

        let mut log_alphas_cumprod = Vec::with_capacity(num_steps);
        let mut log_cumprod = 0.0f64;
        for beta in betas {
            let next = log_cumprod + (-beta).ln_1p();
            if !(next.is_finite() && next < log_cumprod) {
                return Err(DiffusionError::config(format!(
                    "ln(alpha_bar[{}]) = {next} is not strictly decreasing and finite",
                    log_alphas_cumprod.len() + 1
                )));
            }
            log_alphas_cumprod.push(next);
            log_cumprod = next;
        }

        let alphas_cumprod: Vec<f64> = log_alphas_cumprod.iter().map(|l| l.exp()).collect();
        let one_minus_alphas_cumprod: Vec<f64> =
            log_alphas_cumprod.iter().map(|l| -l.exp_m1()).collect();
        let sqrt_alphas_cumprod = log_alphas_cumprod.iter().map(|l| (0.5 * l).exp()).collect();
        let sqrt_one_minus_alphas_cumprod: Vec<f64> =
            one_minus_alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_recip_alphas = alphas.iter().map(|a| (1.0 / a).sqrt()).collect();
        let eps_coefs = betas
            .iter()
            .zip(&sqrt_one_minus_alphas_cumprod)
            .map(|(b, s)| b / s)
            .collect();
        let sqrt_betas = betas.iter().map(|b| b.sqrt()).collect();

        // β̃_t = (1 - ᾱ_{t-1}) / (1 - ᾱ_t) * β_t, zero at the first step
        let posterior_variance = (0..num_steps)
            .map(|i| {
                let prev = if i == 0 { 0.0 } else { one_minus_alphas_cumprod[i - 1] };
                prev / one_minus_alphas_cumprod[i] * betas[i]
            })
            .collect();

        tracing::debug!(
            num_steps,
            final_log_alpha_bar = log_alphas_cumprod[num_steps - 1],
            "derived diffusion coefficients"
        );

        Ok(Self {
            schedule,
            alphas,
            log_alphas_cumprod,
            alphas_cumprod,
            one_minus_alphas_cumprod,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            sqrt_recip_alphas,
            eps_coefs,
            sqrt_betas,
            posterior_variance,
        })
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn num_steps(&self) -> usize {
        self.schedule.num_steps()
    }

    /// Fails unless `t` is a valid step in `1..=T`.
    pub fn check_step(&self, t: usize) -> Result<()> {
        if t == 0 || t > self.num_steps() {
            return Err(DiffusionError::config(format!(
                "step {t} outside [1, {}]",
                self.num_steps()
            )));
        }
        Ok(())
    }

    // The accessors below take a 1-based step and panic outside `1..=T`;
    // callers validate with `check_step` first.

    pub fn beta(&self, t: usize) -> f64 {
        self.schedule.beta(t)
    }

    pub fn alpha(&self, t: usize) -> f64 {
        self.alphas[t - 1]
    }

    /// `alpha_bar[t]`, with `alpha_bar[0] = 1`.
    pub fn alpha_bar(&self, t: usize) -> f64 {
        if t == 0 {
            1.0
        } else {
            self.alphas_cumprod[t - 1]
        }
    }

    /// `ln(alpha_bar[t])`, finite even where `alpha_bar[t]` underflows to 0.
    pub fn log_alpha_bar(&self, t: usize) -> f64 {
        if t == 0 {
            0.0
        } else {
            self.log_alphas_cumprod[t - 1]
        }
    }

    pub fn one_minus_alpha_bar(&self, t: usize) -> f64 {
        self.one_minus_alphas_cumprod[t - 1]
    }

    pub fn sqrt_alpha_bar(&self, t: usize) -> f64 {
        self.sqrt_alphas_cumprod[t - 1]
    }

    pub fn sqrt_one_minus_alpha_bar(&self, t: usize) -> f64 {
        self.sqrt_one_minus_alphas_cumprod[t - 1]
    }

    /// `sqrt(1 / alpha[t])`
    pub fn sqrt_recip_alpha(&self, t: usize) -> f64 {
        self.sqrt_recip_alphas[t - 1]
    }

    /// `beta[t] / sqrt(1 - alpha_bar[t])`
    pub fn eps_coef(&self, t: usize) -> f64 {
        self.eps_coefs[t - 1]
    }

    pub fn sqrt_beta(&self, t: usize) -> f64 {
        self.sqrt_betas[t - 1]
    }

    pub fn posterior_variance(&self, t: usize) -> f64 {
        self.posterior_variance[t - 1]
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    /// Get the signal-to-noise ratio at each timestep.
    pub fn snr(&self) -> Vec<f64> {
        self.alphas_cumprod
            .iter()
            .zip(&self.one_minus_alphas_cumprod)
            .map(|(a, one_minus)| a / one_minus)
            .collect()
    }

    /// Tensor versions of the closed-form coefficients, for per-example gathering.
    pub fn to_tensors(&self, kind: Kind, device: Device) -> CoefficientTensors {
        let tensor = |values: &[f64]| Tensor::from_slice(values).to_kind(kind).to_device(device);
        CoefficientTensors {
            sqrt_alphas_cumprod: tensor(&self.sqrt_alphas_cumprod),
            sqrt_one_minus_alphas_cumprod: tensor(&self.sqrt_one_minus_alphas_cumprod),
        }
    }
}

/// Tensor versions of the schedule parameters.
#[derive(Debug)]
pub struct CoefficientTensors {
    pub sqrt_alphas_cumprod: Tensor,
    pub sqrt_one_minus_alphas_cumprod: Tensor,
}

impl CoefficientTensors {
    pub fn matches(&self, kind: Kind, device: Device) -> bool {
        self.sqrt_alphas_cumprod.kind() == kind && self.sqrt_alphas_cumprod.device() == device
    }

    /// Add noise to data at per-example steps `t` (1-based `Int64`, one per batch row).
    pub fn add_noise(&self, x_0: &Tensor, t: &Tensor, noise: &Tensor) -> Tensor {
        let index = t - 1;
        let mut shape = vec![-1i64];
        shape.resize(x_0.dim(), 1);

        let sqrt_alpha = self.sqrt_alphas_cumprod.index_select(0, &index).view(shape.as_slice());
        let sqrt_one_minus_alpha =
            self.sqrt_one_minus_alphas_cumprod.index_select(0, &index).view(shape.as_slice());

        sqrt_alpha * x_0 + sqrt_one_minus_alpha * noise
    }
}

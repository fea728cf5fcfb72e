//! Noise schedules for the forward diffusion process.
//!
//! A schedule is the sequence of per-step variances `beta[1..T]`. Steps are
//! addressed 1-based everywhere in the public API; `betas()[t - 1]` is
//! `beta[t]`.
use std::f64::consts::FRAC_PI_2;

use serde::{Deserialize, Serialize};

use crate::error::{DiffusionError, Result};

pub mod coefficients;

pub use coefficients::{CoefficientTensors, DerivedCoefficients};

/// Lower clip applied to cosine betas so the first steps stay strictly positive.
const COSINE_MIN_BETA: f64 = 1e-8;

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Linear interpolation between both endpoints, inclusive.
    Linear { beta_start: f64, beta_end: f64 },
    /// Improved-DDPM cosine schedule on the cumulative signal curve.
    Cosine {
        #[serde(default = "default_cosine_s")]
        s: f64,
        #[serde(default = "default_max_beta")]
        max_beta: f64,
    },
    /// Logistic curve over `[low, high]`, rescaled into `[beta_start, beta_end]`.
    Sigmoid {
        beta_start: f64,
        beta_end: f64,
        #[serde(default = "default_sigmoid_low")]
        low: f64,
        #[serde(default = "default_sigmoid_high")]
        high: f64,
    },
    /// Explicit betas; the number of steps must match `betas.len()`.
    Custom { betas: Vec<f64> },
}

fn default_cosine_s() -> f64 {
    0.008
}

fn default_max_beta() -> f64 {
    0.999
}

fn default_sigmoid_low() -> f64 {
    -5.0
}

fn default_sigmoid_high() -> f64 {
    5.0
}

impl Default for BetaSchedule {
    fn default() -> Self {
        BetaSchedule::Linear { beta_start: 1e-4, beta_end: 0.02 }
    }
}

impl BetaSchedule {
    /// Default parameters for a schedule shape given by name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "linear" => Ok(BetaSchedule::default()),
            "cosine" => {
                Ok(BetaSchedule::Cosine { s: default_cosine_s(), max_beta: default_max_beta() })
            }
            "sigmoid" => Ok(BetaSchedule::Sigmoid {
                beta_start: 1e-4,
                beta_end: 0.02,
                low: default_sigmoid_low(),
                high: default_sigmoid_high(),
            }),
            other => Err(DiffusionError::config(format!(
                "unknown beta schedule {other:?}, expected linear, cosine or sigmoid"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BetaSchedule::Linear { .. } => "linear",
            BetaSchedule::Cosine { .. } => "cosine",
            BetaSchedule::Sigmoid { .. } => "sigmoid",
            BetaSchedule::Custom { .. } => "custom",
        }
    }
}

/// Immutable sequence of betas for `num_steps` diffusion steps.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    num_steps: usize,
    betas: Vec<f64>,
    kind: BetaSchedule,
}

impl NoiseSchedule {
    /// Build the betas for `num_steps` steps with the given shape.
    pub fn build(num_steps: usize, kind: &BetaSchedule) -> Result<Self> {
        if num_steps < 1 {
            return Err(DiffusionError::config("number of diffusion steps must be at least 1"));
        }
        let betas = match kind {
            BetaSchedule::Linear { beta_start, beta_end } => {
                check_beta_range(*beta_start, *beta_end, num_steps)?;
                linear_betas(num_steps, *beta_start, *beta_end)
            }
            BetaSchedule::Cosine { s, max_beta } => {
                if !(s.is_finite() && *s >= 0.0) {
                    return Err(DiffusionError::config(format!(
                        "cosine offset must be >= 0, got {s}"
                    )));
                }
                if !(*max_beta > COSINE_MIN_BETA && *max_beta < 1.0) {
                    return Err(DiffusionError::config(format!(
                        "cosine max_beta must lie in ({COSINE_MIN_BETA}, 1), got {max_beta}"
                    )));
                }
                betas_for_alpha_bar(num_steps, *s, *max_beta)
            }
            BetaSchedule::Sigmoid { beta_start, beta_end, low, high } => {
                check_beta_range(*beta_start, *beta_end, num_steps)?;
                if !(low.is_finite() && high.is_finite() && low < high) {
                    return Err(DiffusionError::config(format!(
                        "sigmoid range must satisfy low < high, got ({low}, {high})"
                    )));
                }
                sigmoid_betas(num_steps, *beta_start, *beta_end, *low, *high)
            }
            BetaSchedule::Custom { betas } => {
                if betas.len() != num_steps {
                    return Err(DiffusionError::config(format!(
                        "custom schedule lists {} betas for {num_steps} steps",
                        betas.len()
                    )));
                }
                betas.clone()
            }
        };
        if let Some((idx, beta)) =
            betas.iter().enumerate().find(|(_, b)| !(b.is_finite() && **b > 0.0 && **b < 1.0))
        {
            return Err(DiffusionError::config(format!(
                "beta[{}] = {beta} lies outside (0, 1)",
                idx + 1
            )));
        }
        tracing::debug!(schedule = kind.name(), num_steps, "built noise schedule");
        Ok(Self { num_steps, betas, kind: kind.clone() })
    }

    /// Create a linear noise schedule with the DDPM defaults `(1e-4, 0.02)`.
    pub fn linear(num_steps: usize) -> Result<Self> {
        Self::build(num_steps, &BetaSchedule::from_name("linear")?)
    }

    /// Create a cosine noise schedule with `s = 0.008`, `max_beta = 0.999`.
    pub fn cosine(num_steps: usize) -> Result<Self> {
        Self::build(num_steps, &BetaSchedule::from_name("cosine")?)
    }

    /// Create a sigmoid noise schedule over `[-5, 5]` rescaled to `(1e-4, 0.02)`.
    pub fn sigmoid(num_steps: usize) -> Result<Self> {
        Self::build(num_steps, &BetaSchedule::from_name("sigmoid")?)
    }

    /// Validate a caller-given beta sequence.
    pub fn from_betas(betas: Vec<f64>) -> Result<Self> {
        let num_steps = betas.len();
        Self::build(num_steps, &BetaSchedule::Custom { betas })
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    /// `beta[t]` for `t` in `1..=T`.
    pub fn beta(&self, t: usize) -> f64 {
        self.betas[t - 1]
    }

    pub fn kind(&self) -> &BetaSchedule {
        &self.kind
    }
}

fn check_beta_range(beta_start: f64, beta_end: f64, num_steps: usize) -> Result<()> {
    let in_unit = |b: f64| b.is_finite() && b > 0.0 && b < 1.0;
    if !in_unit(beta_start) || !in_unit(beta_end) {
        return Err(DiffusionError::config(format!(
            "beta range ({beta_start}, {beta_end}) must lie inside (0, 1)"
        )));
    }
    if num_steps > 1 && beta_start >= beta_end {
        return Err(DiffusionError::config(format!(
            "beta_start ({beta_start}) must be below beta_end ({beta_end})"
        )));
    }
    Ok(())
}

fn linear_betas(num_steps: usize, beta_start: f64, beta_end: f64) -> Vec<f64> {
    if num_steps == 1 {
        return vec![beta_start];
    }
    (0..num_steps)
        .map(|i| beta_start + (beta_end - beta_start) * i as f64 / (num_steps - 1) as f64)
        .collect()
}

/// Create a beta schedule that discretizes the cosine alpha_bar function, which defines the
/// cumulative product of `(1-beta)` over time from `t = [0,1]`.
fn betas_for_alpha_bar(num_steps: usize, s: f64, max_beta: f64) -> Vec<f64> {
    let alpha_bar = |u: f64| ((u + s) / (1.0 + s) * FRAC_PI_2).cos().powi(2);
    let alpha_bar_0 = alpha_bar(0.0);
    (1..=num_steps)
        .map(|t| {
            let prev = alpha_bar((t - 1) as f64 / num_steps as f64) / alpha_bar_0;
            let curr = alpha_bar(t as f64 / num_steps as f64) / alpha_bar_0;
            (1.0 - curr / prev).clamp(COSINE_MIN_BETA, max_beta)
        })
        .collect()
}

fn sigmoid_betas(
    num_steps: usize,
    beta_start: f64,
    beta_end: f64,
    low: f64,
    high: f64,
) -> Vec<f64> {
    let sigmoid = |x: f64| 1.0 / (1.0 + (-x).exp());
    let (sig_low, sig_high) = (sigmoid(low), sigmoid(high));
    let point = |i: usize| {
        if num_steps == 1 {
            (low + high) / 2.0
        } else {
            low + (high - low) * i as f64 / (num_steps - 1) as f64
        }
    };
    (0..num_steps)
        .map(|i| {
            let unit = (sigmoid(point(i)) - sig_low) / (sig_high - sig_low);
            beta_start + unit * (beta_end - beta_start)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-12, "{a} != {b}");
    }

    #[test]
    fn test_linear_endpoints_inclusive() {
        let linear = BetaSchedule::Linear { beta_start: 0.1, beta_end: 0.4 };
        let schedule = NoiseSchedule::build(4, &linear).unwrap();
        let expected = [0.1, 0.2, 0.3, 0.4];
        for (beta, want) in schedule.betas().iter().zip(expected) {
            assert_close(*beta, want);
        }
        assert_close(schedule.beta(1), 0.1);
        assert_close(schedule.beta(4), 0.4);
    }

    #[test]
    fn test_linear_strictly_increasing() {
        let schedule = NoiseSchedule::linear(100).unwrap();
        assert_eq!(schedule.num_steps(), 100);
        assert!(schedule.betas().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_cosine_clipped_into_unit_interval() {
        for steps in [1, 2, 10, 1000] {
            let schedule = NoiseSchedule::cosine(steps).unwrap();
            assert!(schedule.betas().iter().all(|b| *b > 0.0 && *b <= 0.999));
        }
        let schedule = NoiseSchedule::cosine(1000).unwrap();
        // the cumulative curve reaches zero at u = 1, so the last beta is clipped
        assert_close(schedule.beta(1000), 0.999);
    }

    #[test]
    fn test_sigmoid_rescaled_to_range() {
        let kind = BetaSchedule::Sigmoid { beta_start: 0.01, beta_end: 0.2, low: -5.0, high: 5.0 };
        let schedule = NoiseSchedule::build(50, &kind).unwrap();
        assert_close(schedule.beta(1), 0.01);
        assert_close(schedule.beta(50), 0.2);
        assert!(schedule.betas().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_single_step_schedules() {
        for name in ["linear", "cosine", "sigmoid"] {
            let kind = BetaSchedule::from_name(name).unwrap();
            let schedule = NoiseSchedule::build(1, &kind).unwrap();
            assert_eq!(schedule.betas().len(), 1);
            assert!(schedule.beta(1) > 0.0 && schedule.beta(1) < 1.0);
        }
    }

    #[test]
    fn test_invalid_configurations() {
        assert!(matches!(NoiseSchedule::linear(0), Err(DiffusionError::Config(_))));
        assert!(matches!(BetaSchedule::from_name("quadratic"), Err(DiffusionError::Config(_))));
        let reversed = BetaSchedule::Linear { beta_start: 0.2, beta_end: 0.1 };
        assert!(NoiseSchedule::build(10, &reversed).is_err());
        let outside = BetaSchedule::Linear { beta_start: 0.5, beta_end: 1.0 };
        assert!(NoiseSchedule::build(10, &outside).is_err());
        let bad_range =
            BetaSchedule::Sigmoid { beta_start: 0.01, beta_end: 0.02, low: 3.0, high: -3.0 };
        assert!(NoiseSchedule::build(10, &bad_range).is_err());
        assert!(NoiseSchedule::from_betas(vec![0.1, 1.0]).is_err());
        assert!(NoiseSchedule::from_betas(vec![]).is_err());
    }
}

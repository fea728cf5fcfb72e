//! Forward (noising) process.
use std::sync::{Arc, Mutex, PoisonError};

use tch::Tensor;

use crate::error::{DiffusionError, Result};
use crate::noise::NoiseSource;
use crate::schedule::{CoefficientTensors, DerivedCoefficients};
use crate::trajectory::Trajectory;
use crate::utils::{self, check_same_shape, check_sample};

/// Samples from `q(x_t | x_{t-1})` and from the closed-form marginal `q(x_t | x_0)`.
#[derive(Debug, Clone)]
pub struct ForwardProcess {
    coeffs: Arc<DerivedCoefficients>,
    sample_shape: Option<Vec<i64>>,
    // gather tables for the last (kind, device) seen by `diffuse_batch`
    tensors: Arc<Mutex<Option<CoefficientTensors>>>,
}

impl ForwardProcess {
    pub fn new(coeffs: Arc<DerivedCoefficients>) -> Self {
        Self { coeffs, sample_shape: None, tensors: Arc::new(Mutex::new(None)) }
    }

    /// Reject inputs whose per-example shape differs from `shape`.
    pub fn with_sample_shape(mut self, shape: Vec<i64>) -> Self {
        self.sample_shape = Some(shape);
        self
    }

    pub fn coefficients(&self) -> &DerivedCoefficients {
        &self.coeffs
    }

    /// `x_t = sqrt(alpha[t]) * x_{t-1} + sqrt(beta[t]) * eps`
    pub fn diffuse_one_step<N>(&self, x_prev: &Tensor, t: usize, noise: &mut N) -> Result<Tensor>
    where
        N: NoiseSource + ?Sized,
    {
        self.coeffs.check_step(t)?;
        check_sample(x_prev, self.sample_shape.as_deref())?;
        let eps = noise.randn_like(x_prev)?;
        Ok(x_prev * self.coeffs.alpha(t).sqrt() + eps * self.coeffs.sqrt_beta(t))
    }

    /// Single jump to step `t`: `x_t = sqrt(alpha_bar[t]) * x_0 + sqrt(1 - alpha_bar[t]) * eps`.
    pub fn diffuse<N>(&self, x_0: &Tensor, t: usize, noise: &mut N) -> Result<Tensor>
    where
        N: NoiseSource + ?Sized,
    {
        self.coeffs.check_step(t)?;
        check_sample(x_0, self.sample_shape.as_deref())?;
        let eps = noise.randn_like(x_0)?;
        self.diffuse_with_noise(x_0, t, &eps)
    }

    /// The closed form with caller-supplied noise.
    pub fn diffuse_with_noise(&self, x_0: &Tensor, t: usize, eps: &Tensor) -> Result<Tensor> {
        self.coeffs.check_step(t)?;
        check_sample(x_0, self.sample_shape.as_deref())?;
        check_same_shape(x_0, eps)?;
        Ok(x_0 * self.coeffs.sqrt_alpha_bar(t) + eps * self.coeffs.sqrt_one_minus_alpha_bar(t))
    }

    /// The closed form with one step per batch row.
    pub fn diffuse_batch(&self, x_0: &Tensor, steps: &[usize], eps: &Tensor) -> Result<Tensor> {
        check_sample(x_0, self.sample_shape.as_deref())?;
        check_same_shape(x_0, eps)?;
        let batch = utils::batch_size(x_0);
        if steps.len() != batch {
            return Err(DiffusionError::shape(&[batch as i64], &[steps.len() as i64]));
        }
        for &t in steps {
            self.coeffs.check_step(t)?;
        }
        let t = utils::step_tensor(steps, x_0.device());
        let mut cache = self.tensors.lock().unwrap_or_else(PoisonError::into_inner);
        let tensors = match cache.take() {
            Some(tensors) if tensors.matches(x_0.kind(), x_0.device()) => tensors,
            _ => self.coeffs.to_tensors(x_0.kind(), x_0.device()),
        };
        let noisy = tensors.add_noise(x_0, &t, eps);
        *cache = Some(tensors);
        Ok(noisy)
    }

    #[cfg(test)]
    fn cached_options(&self) -> Option<(tch::Kind, tch::Device)> {
        let cache = self.tensors.lock().unwrap_or_else(PoisonError::into_inner);
        cache.as_ref().map(|t| (t.sqrt_alphas_cumprod.kind(), t.sqrt_alphas_cumprod.device()))
    }

    /// Run the chain step by step; index 0 is `x_0` itself and index `t` the
    /// state after `t` one-step applications.
    pub fn diffuse_all_steps<N>(&self, x_0: &Tensor, noise: &mut N) -> Result<Trajectory>
    where
        N: NoiseSource + ?Sized,
    {
        check_sample(x_0, self.sample_shape.as_deref())?;
        let num_steps = self.coeffs.num_steps();
        let mut states = Vec::with_capacity(num_steps + 1);
        states.push(x_0.copy());
        for t in 1..=num_steps {
            let next = self.diffuse_one_step(&states[t - 1], t, noise)?;
            states.push(next);
        }
        Ok(Trajectory::new(states))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::{ScriptedNoise, SeededNoise};
    use crate::schedule::{BetaSchedule, NoiseSchedule};
    use tch::{Device, Kind};

    fn process(num_steps: usize, beta_start: f64, beta_end: f64) -> ForwardProcess {
        let linear = BetaSchedule::Linear { beta_start, beta_end };
        let schedule = NoiseSchedule::build(num_steps, &linear).unwrap();
        ForwardProcess::new(Arc::new(DerivedCoefficients::new(schedule).unwrap()))
    }

    fn values(xs: &Tensor) -> Vec<f64> {
        Vec::<f64>::try_from(&xs.to_kind(Kind::Double).view([-1])).unwrap()
    }

    #[test]
    fn test_diffuse_with_known_noise() {
        let forward = process(4, 0.1, 0.4);
        let x_0 = Tensor::from_slice(&[0.0f64, 0.0]).view([1, 2]);
        let eps = Tensor::from_slice(&[1.0f64, 0.0]).view([1, 2]);
        let x_2 = values(&forward.diffuse_with_noise(&x_0, 2, &eps).unwrap());
        assert!((x_2[0] - 0.28f64.sqrt()).abs() < 1e-12);
        assert!((x_2[0] - 0.529).abs() < 1e-3);
        assert_eq!(x_2[1], 0.0);

        let mut scripted = ScriptedNoise::new().push_normal(eps.copy());
        let jumped = forward.diffuse(&x_0, 2, &mut scripted).unwrap();
        assert_eq!(values(&jumped), x_2);
    }

    #[test]
    fn test_single_step_matches_closed_form() {
        let forward = process(1, 0.3, 0.3);
        let x_0 = Tensor::from_slice(&[1.0f64, -2.0, 0.5]).view([1, 3]);
        let eps = Tensor::from_slice(&[0.3f64, 0.1, -1.2]).view([1, 3]);

        let mut scripted = ScriptedNoise::new().push_normal(eps.copy());
        let trajectory = forward.diffuse_all_steps(&x_0, &mut scripted).unwrap();
        assert_eq!(trajectory.len(), 2);

        let closed = forward.diffuse_with_noise(&x_0, 1, &eps).unwrap();
        for (a, b) in values(&trajectory[1]).iter().zip(values(&closed)) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_trajectory_starts_at_input() {
        let forward = process(20, 1e-3, 0.05);
        let x_0 = SeededNoise::new(3).standard_normal(&[8, 2], (Kind::Float, Device::Cpu)).unwrap();
        let trajectory = forward.diffuse_all_steps(&x_0, &mut SeededNoise::new(4)).unwrap();
        assert_eq!(trajectory.len(), 21);
        assert!(trajectory[0].equal(&x_0));
        assert!(trajectory.iter().all(|x| x.size() == vec![8, 2]));
        assert_eq!(trajectory.stack().unwrap().size(), vec![21, 8, 2]);
    }

    #[test]
    fn test_marginal_matches_step_composition() {
        let forward = process(10, 0.02, 0.2);
        let n = 20_000;
        let x_0 = Tensor::from_slice(&[1.0f64, -2.0]).view([1, 2]).repeat([n, 1]);
        let t = 6;
        let sqrt_alpha_bar = forward.coefficients().sqrt_alpha_bar(t);
        let variance = forward.coefficients().one_minus_alpha_bar(t);

        let trajectory = forward.diffuse_all_steps(&x_0, &mut SeededNoise::new(11)).unwrap();
        let jumped = forward.diffuse(&x_0, t, &mut SeededNoise::new(12)).unwrap();

        for sample in [&trajectory[t], &jumped] {
            let mean = values(&sample.mean_dim(Some([0i64].as_slice()), false, Kind::Double));
            let var = values(&sample.var_dim(Some([0i64].as_slice()), true, false));
            for (column, x) in [1.0f64, -2.0].iter().enumerate() {
                assert!((mean[column] - sqrt_alpha_bar * x).abs() < 0.03, "mean {mean:?}");
                assert!((var[column] - variance).abs() < 0.03, "var {var:?}");
            }
        }
    }

    #[test]
    fn test_shapes_preserved() {
        let forward = process(5, 0.01, 0.1);
        let mut noise = SeededNoise::new(0);
        let x_0 = noise.standard_normal(&[4, 3, 7], (Kind::Float, Device::Cpu)).unwrap();
        assert_eq!(forward.diffuse(&x_0, 3, &mut noise).unwrap().size(), vec![4, 3, 7]);
        assert_eq!(forward.diffuse_one_step(&x_0, 5, &mut noise).unwrap().size(), vec![4, 3, 7]);
        let eps = noise.randn_like(&x_0).unwrap();
        let batched = forward.diffuse_batch(&x_0, &[1, 2, 3, 5], &eps).unwrap();
        assert_eq!(batched.size(), vec![4, 3, 7]);
    }

    #[test]
    fn test_diffuse_batch_uses_each_rows_step() {
        let forward = process(4, 0.1, 0.4);
        let x_0 = Tensor::from_slice(&[1.0f64, 2.0, 1.0, 2.0]).view([2, 2]);
        let eps = Tensor::from_slice(&[0.5f64, -0.5, 0.5, -0.5]).view([2, 2]);
        let batched = forward.diffuse_batch(&x_0, &[1, 3], &eps).unwrap();
        let row = |i: i64, t: usize| {
            forward.diffuse_with_noise(&x_0.narrow(0, i, 1), t, &eps.narrow(0, i, 1)).unwrap()
        };
        let (first, second) = (row(0, 1), row(1, 3));
        let expected = Tensor::cat(&[first, second], 0);
        assert!(batched.allclose(&expected, 1e-12, 1e-12, false));
    }

    #[test]
    fn test_diffuse_batch_reuses_gather_tables() {
        let forward = process(4, 0.1, 0.4);
        assert_eq!(forward.cached_options(), None);
        let x_0 = Tensor::from_slice(&[1.0f64, 2.0, 1.0, 2.0]).view([2, 2]);
        let eps = Tensor::from_slice(&[0.5f64, -0.5, 0.5, -0.5]).view([2, 2]);
        let first = forward.diffuse_batch(&x_0, &[2, 4], &eps).unwrap();
        assert_eq!(forward.cached_options(), Some((Kind::Double, Device::Cpu)));
        let again = forward.clone().diffuse_batch(&x_0, &[2, 4], &eps).unwrap();
        assert!(first.equal(&again));

        let x_f32 = x_0.to_kind(Kind::Float);
        let eps_f32 = eps.to_kind(Kind::Float);
        let single = forward.diffuse_batch(&x_f32, &[2, 4], &eps_f32).unwrap();
        assert_eq!(single.kind(), Kind::Float);
        assert_eq!(forward.cached_options(), Some((Kind::Float, Device::Cpu)));
        assert!(single.to_kind(Kind::Double).allclose(&first, 1e-6, 1e-6, false));
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let forward = process(4, 0.1, 0.4).with_sample_shape(vec![2]);
        let mut noise = SeededNoise::new(0);
        let x_0 = Tensor::zeros([3, 2], (Kind::Float, Device::Cpu));
        assert!(matches!(forward.diffuse(&x_0, 0, &mut noise), Err(DiffusionError::Config(_))));
        assert!(matches!(forward.diffuse(&x_0, 5, &mut noise), Err(DiffusionError::Config(_))));
        let wrong = Tensor::zeros([3, 4], (Kind::Float, Device::Cpu));
        assert!(matches!(
            forward.diffuse(&wrong, 1, &mut noise),
            Err(DiffusionError::ShapeMismatch { .. })
        ));
        let eps = Tensor::zeros([2, 2], (Kind::Float, Device::Cpu));
        assert!(forward.diffuse_with_noise(&x_0, 1, &eps).is_err());
        let eps = Tensor::zeros([3, 2], (Kind::Float, Device::Cpu));
        assert!(forward.diffuse_batch(&x_0, &[1, 2], &eps).is_err());
    }
}

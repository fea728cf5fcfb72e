//! Reverse (denoising) process: ancestral sampling from `x_T ~ N(0, I)` down to `x_0`.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

use crate::error::{DiffusionError, Result};
use crate::noise::NoiseSource;
use crate::predictor::{predict_checked, NoisePredictor};
use crate::schedule::DerivedCoefficients;
use crate::trajectory::Trajectory;
use crate::utils::{self, check_sample};

/// Noise scale `sigma_t` injected by the transitions with `t > 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceKind {
    /// `sigma_t = sqrt(beta[t])`
    #[default]
    FixedLarge,
    /// `sigma_t = sqrt(beta_tilde[t])`, the forward posterior variance.
    FixedSmall,
}

#[derive(Debug, Clone)]
pub struct ReverseProcess {
    coeffs: Arc<DerivedCoefficients>,
    variance: VarianceKind,
    clip_sample: Option<f64>,
    sample_shape: Option<Vec<i64>>,
}

impl ReverseProcess {
    pub fn new(coeffs: Arc<DerivedCoefficients>) -> Self {
        Self { coeffs, variance: VarianceKind::default(), clip_sample: None, sample_shape: None }
    }

    pub fn with_variance(mut self, variance: VarianceKind) -> Self {
        self.variance = variance;
        self
    }

    /// Clamp the final sample into `[-range, range]`.
    pub fn with_clip_sample(mut self, range: Option<f64>) -> Self {
        self.clip_sample = range;
        self
    }

    pub fn with_sample_shape(mut self, shape: Vec<i64>) -> Self {
        self.sample_shape = Some(shape);
        self
    }

    pub fn coefficients(&self) -> &DerivedCoefficients {
        &self.coeffs
    }

    pub fn num_steps(&self) -> usize {
        self.coeffs.num_steps()
    }

    pub fn sigma(&self, t: usize) -> f64 {
        match self.variance {
            VarianceKind::FixedLarge => self.coeffs.sqrt_beta(t),
            VarianceKind::FixedSmall => self.coeffs.posterior_variance(t).sqrt(),
        }
    }

    /// `mu = sqrt(1/alpha[t]) * (x_t - beta[t] / sqrt(1 - alpha_bar[t]) * eps_hat)`
    pub fn mean<P>(&self, x_t: &Tensor, t: usize, predictor: &P) -> Result<Tensor>
    where
        P: NoisePredictor + ?Sized,
    {
        self.coeffs.check_step(t)?;
        check_sample(x_t, self.sample_shape.as_deref())?;
        let steps = vec![t; utils::batch_size(x_t)];
        let eps_hat = predict_checked(predictor, x_t, &utils::step_tensor(&steps, x_t.device()))?;
        Ok((x_t - eps_hat * self.coeffs.eps_coef(t)) * self.coeffs.sqrt_recip_alpha(t))
    }

    /// One transition `x_t -> x_{t-1}`. The transition into `x_0` draws no noise.
    pub fn step<P, N>(&self, x_t: &Tensor, t: usize, predictor: &P, noise: &mut N) -> Result<Tensor>
    where
        P: NoisePredictor + ?Sized,
        N: NoiseSource + ?Sized,
    {
        let mu = self.mean(x_t, t, predictor)?;
        if t > 1 {
            let z = noise.randn_like(&mu)?;
            return Ok(mu + z * self.sigma(t));
        }
        Ok(match self.clip_sample {
            Some(range) => mu.clamp(-range, range),
            None => mu,
        })
    }

    /// Lazily walk the chain from `x_T`; dropping the iterator abandons the run.
    pub fn steps<'a, P, N>(
        &'a self,
        x_t: &Tensor,
        predictor: &'a P,
        noise: &'a mut N,
    ) -> Result<Denoise<'a, P, N>>
    where
        P: NoisePredictor + ?Sized,
        N: NoiseSource + ?Sized,
    {
        check_sample(x_t, self.sample_shape.as_deref())?;
        Ok(Denoise { process: self, predictor, noise, x: x_t.shallow_clone(), t: self.num_steps() })
    }

    /// All states from `x_T` down to `x_0`; index 0 is the final sample and
    /// index `T` is `x_T` itself.
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
        let mut states = Vec::with_capacity(self.num_steps() + 1);
        states.push(x_t.copy());
        for state in self.steps(x_t, predictor, noise)? {
            let (_, x) = state?;
            states.push(x);
        }
        states.reverse();
        Ok(Trajectory::new(states))
    }

    /// Draw `x_T` of shape `(num_samples, shape...)` and return only `x_0`.
    pub fn generate<P, N>(
        &self,
        shape: &[i64],
        num_samples: usize,
        options: (Kind, Device),
        predictor: &P,
        noise: &mut N,
    ) -> Result<Tensor>
    where
        P: NoisePredictor + ?Sized,
        N: NoiseSource + ?Sized,
    {
        if num_samples < 1 {
            return Err(DiffusionError::config("num_samples must be at least 1"));
        }
        if shape.is_empty() || shape.iter().any(|d| *d < 1) {
            return Err(DiffusionError::config(format!("invalid sample shape {shape:?}")));
        }
        let mut size = vec![num_samples as i64];
        size.extend_from_slice(shape);
        let x_t = noise.standard_normal(&size, options)?;
        self.generate_from(&x_t, predictor, noise)
    }

    /// Final-sample-only run from a caller-supplied `x_T`.
    pub fn generate_from<P, N>(&self, x_t: &Tensor, predictor: &P, noise: &mut N) -> Result<Tensor>
    where
        P: NoisePredictor + ?Sized,
        N: NoiseSource + ?Sized,
    {
        let mut x = x_t.shallow_clone();
        for state in self.steps(x_t, predictor, noise)? {
            x = state?.1;
        }
        Ok(x)
    }
}

/// Forward-only iterator over the reverse chain, yielding `(t - 1, x_{t-1})`
/// for `t = T, ..., 1`.
pub struct Denoise<'a, P: ?Sized, N: ?Sized> {
    process: &'a ReverseProcess,
    predictor: &'a P,
    noise: &'a mut N,
    x: Tensor,
    t: usize,
}

impl<'a, P, N> Denoise<'a, P, N>
where
    P: NoisePredictor + ?Sized,
    N: NoiseSource + ?Sized,
{
    /// Step index of the current state.
    pub fn current_step(&self) -> usize {
        self.t
    }
}

impl<'a, P, N> Iterator for Denoise<'a, P, N>
where
    P: NoisePredictor + ?Sized,
    N: NoiseSource + ?Sized,
{
    type Item = Result<(usize, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.t == 0 {
            return None;
        }
        let t = self.t;
        tracing::trace!(t, "reverse step");
        match self.process.step(&self.x, t, self.predictor, &mut *self.noise) {
            Ok(x_prev) => {
                self.t = t - 1;
                self.x = x_prev.shallow_clone();
                Some(Ok((t - 1, x_prev)))
            }
            Err(e) => {
                self.t = 0;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.t, Some(self.t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::{ScriptedNoise, SeededNoise};
    use crate::predictor::FnPredictor;
    use crate::schedule::{BetaSchedule, NoiseSchedule};

    fn process(num_steps: usize, beta_start: f64, beta_end: f64) -> ReverseProcess {
        let linear = BetaSchedule::Linear { beta_start, beta_end };
        let schedule = NoiseSchedule::build(num_steps, &linear).unwrap();
        ReverseProcess::new(Arc::new(DerivedCoefficients::new(schedule).unwrap()))
    }

    fn values(xs: &Tensor) -> Vec<f64> {
        Vec::<f64>::try_from(&xs.to_kind(Kind::Double).view([-1])).unwrap()
    }

    fn damped() -> FnPredictor<impl Fn(&Tensor, &Tensor) -> Result<Tensor>> {
        FnPredictor::new(|x: &Tensor, t: &Tensor| {
            Ok(x * 0.1 + t.to_kind(x.kind()).view([-1, 1]) * 0.01)
        })
    }

    #[test]
    fn test_single_transition_math() {
        let reverse = process(4, 0.1, 0.4);
        let x_t = Tensor::from_slice(&[1.0f64, 2.0]).view([1, 2]);
        let eps_hat = Tensor::from_slice(&[0.5f64, -0.5]).view([1, 2]);
        let z = Tensor::from_slice(&[1.0f64, 1.0]).view([1, 2]);
        let predictor = FnPredictor::new(|_, _| Ok(eps_hat.copy()));
        let mut noise = ScriptedNoise::new().push_normal(z);
        let x_prev = values(&reverse.step(&x_t, 2, &predictor, &mut noise).unwrap());

        let coef = 0.2 / 0.28f64.sqrt();
        for (i, (x, e)) in [(1.0, 0.5), (2.0, -0.5)].iter().enumerate() {
            let mu = (x - coef * e) / 0.8f64.sqrt();
            assert!((x_prev[i] - (mu + 0.2f64.sqrt())).abs() < 1e-12);
        }
    }

    #[test]
    fn test_final_transition_draws_no_noise() {
        let reverse = process(4, 0.1, 0.4);
        let x_t = Tensor::from_slice(&[1.0f64, -1.0]).view([1, 2]);
        let zero = FnPredictor::new(|x, _| Ok(x.zeros_like()));
        let zeros = || Tensor::zeros([1, 2], (Kind::Double, Device::Cpu));
        let mut noise =
            ScriptedNoise::new().push_normal(zeros()).push_normal(zeros()).push_normal(zeros());

        let trajectory = reverse.denoise_all_steps(&x_t, &zero, &mut noise).unwrap();
        assert_eq!(noise.remaining_normals(), 0);
        assert_eq!(trajectory.len(), 5);
        assert!(trajectory[4].equal(&x_t));
        // no noise anywhere: x_0 = x_T / sqrt(alpha_bar[T])
        let expected = 1.0 / 0.3024f64.sqrt();
        let x_0 = values(&trajectory[0]);
        assert!((x_0[0] - expected).abs() < 1e-12);
        assert!((x_0[1] + expected).abs() < 1e-12);
    }

    #[test]
    fn test_one_step_schedule() {
        let reverse = process(1, 0.2, 0.2);
        let x_t = Tensor::from_slice(&[0.8f64, 0.4]).view([1, 2]);
        let zero = FnPredictor::new(|x, _| Ok(x.zeros_like()));
        let mut noise = ScriptedNoise::new();
        let trajectory = reverse.denoise_all_steps(&x_t, &zero, &mut noise).unwrap();
        assert_eq!(trajectory.len(), 2);
        let x_0 = values(&trajectory[0]);
        assert!((x_0[0] - 0.8 / 0.8f64.sqrt()).abs() < 1e-12);
        let generated = reverse.generate_from(&x_t, &zero, &mut noise).unwrap();
        assert!(generated.equal(&trajectory[0]));
    }

    #[test]
    fn test_generate_matches_trajectory() {
        let reverse = process(25, 1e-3, 0.1);
        let options = (Kind::Float, Device::Cpu);
        let predictor = damped();

        let mut noise_a = SeededNoise::new(42);
        let x_t = noise_a.standard_normal(&[5, 2], options).unwrap();
        let trajectory = reverse.denoise_all_steps(&x_t, &predictor, &mut noise_a).unwrap();

        let mut noise_b = SeededNoise::new(42);
        let generated = reverse.generate(&[2], 5, options, &predictor, &mut noise_b).unwrap();

        assert_eq!(generated.size(), vec![5, 2]);
        assert!(generated.equal(&trajectory[0]));
        assert!(trajectory[25].equal(&x_t));
    }

    #[test]
    fn test_steps_iterator_can_stop_early() {
        let reverse = process(10, 1e-3, 0.1);
        let predictor = damped();
        let mut noise = SeededNoise::new(1);
        let x_t = noise.standard_normal(&[3, 2], (Kind::Float, Device::Cpu)).unwrap();
        let mut steps = reverse.steps(&x_t, &predictor, &mut noise).unwrap();
        assert_eq!(steps.size_hint(), (10, Some(10)));
        let (t, x) = steps.next().unwrap().unwrap();
        assert_eq!(t, 9);
        assert_eq!(x.size(), vec![3, 2]);
        assert_eq!(steps.current_step(), 9);
        assert_eq!(steps.take(3).count(), 3);
    }

    #[test]
    fn test_variance_kinds() {
        let large = process(10, 0.01, 0.2);
        let small = large.clone().with_variance(VarianceKind::FixedSmall);
        assert_eq!(small.sigma(1), 0.0);
        for t in 2..=10 {
            assert!(small.sigma(t) < large.sigma(t));
            assert!((large.sigma(t) - large.coefficients().beta(t).sqrt()).abs() < 1e-15);
        }
    }

    #[test]
    fn test_clip_sample_applies_to_final_state() {
        let reverse = process(3, 0.1, 0.3).with_clip_sample(Some(1.0));
        let zero = FnPredictor::new(|x, _| Ok(x.zeros_like()));
        let x_t = Tensor::full([4, 2], 50.0, (Kind::Float, Device::Cpu));
        let x_0 = reverse.generate_from(&x_t, &zero, &mut SeededNoise::new(0)).unwrap();
        assert!(values(&x_0).iter().all(|v| v.abs() <= 1.0));
    }

    #[test]
    fn test_shape_and_collaborator_faults() {
        let reverse = process(3, 0.1, 0.3).with_sample_shape(vec![2]);
        let options = (Kind::Float, Device::Cpu);
        let zero = FnPredictor::new(|x, _| Ok(x.zeros_like()));
        let mut noise = SeededNoise::new(0);
        let wrong = Tensor::zeros([4, 3], options);
        assert!(matches!(
            reverse.denoise_all_steps(&wrong, &zero, &mut noise),
            Err(DiffusionError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            reverse.generate(&[3], 4, options, &zero, &mut noise),
            Err(DiffusionError::ShapeMismatch { .. })
        ));
        assert!(reverse.generate(&[2], 0, options, &zero, &mut noise).is_err());

        let broken = FnPredictor::new(|x, _| Ok(x.narrow(1, 0, 1)));
        assert!(matches!(
            reverse.generate(&[2], 4, options, &broken, &mut noise),
            Err(DiffusionError::Collaborator(_))
        ));
    }
}

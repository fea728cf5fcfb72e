//! Random-draw providers for the stochastic operations.
//!
//! Every forward, reverse and training call takes its randomness from a
//! [`NoiseSource`] owned by the caller, so independent invocations never share
//! a stream and seeded runs replay exactly.
use std::collections::VecDeque;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use tch::{Device, Kind, Tensor};

use crate::error::{DiffusionError, Result};

pub trait NoiseSource {
    /// Standard Gaussian noise of the given size, i.i.d. per element.
    fn standard_normal(&mut self, size: &[i64], options: (Kind, Device)) -> Result<Tensor>;

    /// `count` steps drawn independently and uniformly from `1..=num_steps`.
    fn uniform_steps(&mut self, count: usize, num_steps: usize) -> Result<Vec<usize>>;

    fn randn_like(&mut self, xs: &Tensor) -> Result<Tensor> {
        self.standard_normal(&xs.size(), (xs.kind(), xs.device()))
    }
}

impl<N: NoiseSource + ?Sized> NoiseSource for &mut N {
    fn standard_normal(&mut self, size: &[i64], options: (Kind, Device)) -> Result<Tensor> {
        (**self).standard_normal(size, options)
    }

    fn uniform_steps(&mut self, count: usize, num_steps: usize) -> Result<Vec<usize>> {
        (**self).uniform_steps(count, num_steps)
    }
}

/// Seeded ChaCha8 stream; draws are generated on the host and moved to the
/// requested device, so the values do not depend on the backend.
#[derive(Debug, Clone)]
pub struct SeededNoise {
    rng: ChaCha8Rng,
}

impl SeededNoise {
    pub fn new(seed: u64) -> Self {
        Self { rng: ChaCha8Rng::seed_from_u64(seed) }
    }

    pub fn from_entropy() -> Self {
        Self { rng: ChaCha8Rng::from_entropy() }
    }
}

impl NoiseSource for SeededNoise {
    fn standard_normal(&mut self, size: &[i64], options: (Kind, Device)) -> Result<Tensor> {
        if size.iter().any(|d| *d < 0) {
            return Err(DiffusionError::config(format!("invalid noise size {size:?}")));
        }
        let numel: i64 = size.iter().product();
        let values: Vec<f64> = (0..numel).map(|_| self.rng.sample(StandardNormal)).collect();
        let (kind, device) = options;
        Ok(Tensor::from_slice(&values).view(size).to_kind(kind).to_device(device))
    }

    fn uniform_steps(&mut self, count: usize, num_steps: usize) -> Result<Vec<usize>> {
        if num_steps < 1 {
            return Err(DiffusionError::config("cannot draw steps from an empty schedule"));
        }
        Ok((0..count).map(|_| self.rng.gen_range(1..=num_steps)).collect())
    }
}

/// Replays pre-recorded draws in order; useful for deterministic replay of a
/// known noise realization.
#[derive(Debug, Default)]
pub struct ScriptedNoise {
    normals: VecDeque<Tensor>,
    steps: VecDeque<usize>,
}

impl ScriptedNoise {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_normal(mut self, xs: Tensor) -> Self {
        self.normals.push_back(xs);
        self
    }

    pub fn push_steps(mut self, steps: &[usize]) -> Self {
        self.steps.extend(steps.iter().copied());
        self
    }

    pub fn remaining_normals(&self) -> usize {
        self.normals.len()
    }
}

impl NoiseSource for ScriptedNoise {
    fn standard_normal(&mut self, size: &[i64], options: (Kind, Device)) -> Result<Tensor> {
        let xs = self
            .normals
            .pop_front()
            .ok_or_else(|| DiffusionError::Noise("scripted normal draws exhausted".to_string()))?;
        if xs.size() != size {
            return Err(DiffusionError::shape(size, &xs.size()));
        }
        let (kind, device) = options;
        Ok(xs.to_kind(kind).to_device(device))
    }

    fn uniform_steps(&mut self, count: usize, num_steps: usize) -> Result<Vec<usize>> {
        if self.steps.len() < count {
            return Err(DiffusionError::Noise(format!(
                "requested {count} scripted steps, {} left",
                self.steps.len()
            )));
        }
        let steps: Vec<usize> = self.steps.drain(..count).collect();
        if let Some(bad) = steps.iter().find(|t| **t == 0 || **t > num_steps) {
            return Err(DiffusionError::config(format!(
                "scripted step {bad} outside [1, {num_steps}]"
            )));
        }
        Ok(steps)
    }
}

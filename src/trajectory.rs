use std::ops::Index;

use tch::Tensor;

use crate::error::{DiffusionError, Result};

/// The `T + 1` states of a forward or reverse run.
///
/// Index 0 is the clean end (the input of the forward process, or the final
/// sample of the reverse process) and index `T` is the fully noised end.
#[derive(Debug)]
pub struct Trajectory {
    states: Vec<Tensor>,
}

impl Trajectory {
    pub(crate) fn new(states: Vec<Tensor>) -> Self {
        Self { states }
    }

    /// Number of snapshots, `T + 1`.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Number of transitions recorded, `T`.
    pub fn num_steps(&self) -> usize {
        self.states.len().saturating_sub(1)
    }

    pub fn get(&self, t: usize) -> Option<&Tensor> {
        self.states.get(t)
    }

    pub fn clean(&self) -> Option<&Tensor> {
        self.states.first()
    }

    pub fn noisy(&self) -> Option<&Tensor> {
        self.states.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tensor> {
        self.states.iter()
    }

    /// Stack into a single tensor of shape `(T + 1, batch, features...)`.
    pub fn stack(&self) -> Result<Tensor> {
        if self.states.is_empty() {
            return Err(DiffusionError::config("cannot stack an empty trajectory"));
        }
        Ok(Tensor::f_stack(&self.states, 0)?)
    }

    pub fn into_states(self) -> Vec<Tensor> {
        self.states
    }
}

impl Index<usize> for Trajectory {
    type Output = Tensor;

    fn index(&self, t: usize) -> &Tensor {
        &self.states[t]
    }
}

impl IntoIterator for Trajectory {
    type Item = Tensor;
    type IntoIter = std::vec::IntoIter<Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.states.into_iter()
    }
}

impl<'a> IntoIterator for &'a Trajectory {
    type Item = &'a Tensor;
    type IntoIter = std::slice::Iter<'a, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.states.iter()
    }
}

use tch::{Device, Kind, Tensor};

use crate::error::{DiffusionError, Result};

pub fn get_device() -> Device {
    if tch::utils::has_mps() {
        Device::Mps
    } else {
        Device::cuda_if_available()
    }
}

pub fn count_non_finite(xs: &Tensor) -> Result<i64> {
    let count = xs.isfinite().logical_not().to_kind(Kind::Int64).sum(Kind::Int64);
    Ok(count.f_int64_value(&[])?)
}

/// A sample tensor is batch-first with at least one feature dimension.
pub(crate) fn check_sample(xs: &Tensor, sample_shape: Option<&[i64]>) -> Result<()> {
    let size = xs.size();
    if size.len() < 2 || size.iter().any(|d| *d < 1) {
        let mut expected = vec![-1];
        expected.extend_from_slice(sample_shape.unwrap_or(&[-1]));
        return Err(DiffusionError::shape(&expected, &size));
    }
    if let Some(shape) = sample_shape {
        if size[1..] != *shape {
            let mut expected = vec![size[0]];
            expected.extend_from_slice(shape);
            return Err(DiffusionError::shape(&expected, &size));
        }
    }
    Ok(())
}

pub(crate) fn check_same_shape(expected: &Tensor, actual: &Tensor) -> Result<()> {
    let (expected, actual) = (expected.size(), actual.size());
    if expected != actual {
        return Err(DiffusionError::shape(&expected, &actual));
    }
    Ok(())
}

pub(crate) fn batch_size(xs: &Tensor) -> usize {
    xs.size()[0] as usize
}

/// 1-based steps as a 1-D `Int64` tensor on `device`.
pub(crate) fn step_tensor(steps: &[usize], device: Device) -> Tensor {
    let steps: Vec<i64> = steps.iter().map(|t| *t as i64).collect();
    Tensor::from_slice(&steps).to_device(device)
}

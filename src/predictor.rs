//! The noise-prediction capability consumed by the training objective and the
//! reverse process.
use tch::Tensor;

use crate::error::{DiffusionError, Result};
use crate::utils;

/// A function approximator `(x_t, t) -> predicted noise`.
///
/// `t` is a 1-D `Int64` tensor holding one 1-based step per batch row. The
/// returned tensor must have the shape of `x_t`.
pub trait NoisePredictor {
    fn predict(&self, x_t: &Tensor, t: &Tensor) -> Result<Tensor>;
}

impl<P: NoisePredictor + ?Sized> NoisePredictor for &P {
    fn predict(&self, x_t: &Tensor, t: &Tensor) -> Result<Tensor> {
        (**self).predict(x_t, t)
    }
}

impl<P: NoisePredictor + ?Sized> NoisePredictor for Box<P> {
    fn predict(&self, x_t: &Tensor, t: &Tensor) -> Result<Tensor> {
        (**self).predict(x_t, t)
    }
}

/// Adapts a closure into a [`NoisePredictor`].
pub struct FnPredictor<F>(F);

impl<F> FnPredictor<F>
where
    F: Fn(&Tensor, &Tensor) -> Result<Tensor>,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> NoisePredictor for FnPredictor<F>
where
    F: Fn(&Tensor, &Tensor) -> Result<Tensor>,
{
    fn predict(&self, x_t: &Tensor, t: &Tensor) -> Result<Tensor> {
        (self.0)(x_t, t)
    }
}

/// Query the predictor and reject malformed output rather than masking it.
pub(crate) fn predict_checked<P>(predictor: &P, x_t: &Tensor, t: &Tensor) -> Result<Tensor>
where
    P: NoisePredictor + ?Sized,
{
    let predicted = predictor.predict(x_t, t)?;
    if predicted.size() != x_t.size() {
        return Err(DiffusionError::Collaborator(format!(
            "predicted noise has shape {:?}, expected {:?}",
            predicted.size(),
            x_t.size()
        )));
    }
    let non_finite = utils::count_non_finite(&predicted)?;
    if non_finite > 0 {
        return Err(DiffusionError::Collaborator(format!(
            "predicted noise contains {non_finite} non-finite values"
        )));
    }
    Ok(predicted)
}

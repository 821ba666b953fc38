//! Invariant-enforcing transforms from raw network outputs to valid
//! distribution parameters.
//!
//! Every function here is pure and elementwise (or row-wise), so the result
//! never depends on the order in which agents or scenes are visited. The
//! heads call these unconditionally; nothing downstream re-checks positivity.

use candle_core::{DType, Tensor, D};

use crate::error::{ForecastError, ForecastResult};

/// Numerically stable softplus: `relu(x) + log(1 + exp(-|x|))`.
///
/// `exp` only ever sees non-positive arguments, so it cannot overflow.
pub fn softplus(x: &Tensor) -> candle_core::Result<Tensor> {
    let tail = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    x.relu()? + tail
}

/// Map raw values to Laplace scales `eps + softplus(raw)`, all `>= eps`.
///
/// # Errors
///
/// [`ForecastError::NumericalInstability`] if any raw value was NaN/inf.
pub fn positive_scale(raw: &Tensor, eps: f64) -> ForecastResult<Tensor> {
    let scale = (softplus(raw)? + eps)?;
    ensure_finite("positive_scale", &scale)?;
    Ok(scale)
}

/// Map raw values into `[0, max_gate)` with a scaled sigmoid.
pub fn bounded_gate(raw: &Tensor, max_gate: f64) -> ForecastResult<Tensor> {
    let gate = (candle_nn::ops::sigmoid(raw)? * max_gate)?;
    ensure_finite("bounded_gate", &gate)?;
    Ok(gate)
}

/// Softmax over the last dimension with max-shifting.
///
/// softmax(x) = exp(x - max(x)) / sum(exp(x - max(x)))
pub fn stable_softmax_last_dim(x: &Tensor) -> candle_core::Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let exp_x = x.broadcast_sub(&max)?.exp()?;
    let sum_exp = exp_x.sum_keepdim(D::Minus1)?;
    exp_x.broadcast_div(&sum_exp)
}

/// Log-softmax over the last dimension.
///
/// log_softmax(x) = x - max(x) - log(sum(exp(x - max(x))))
pub fn stable_log_softmax_last_dim(x: &Tensor) -> candle_core::Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let shifted = x.broadcast_sub(&max)?;
    let log_sum_exp = shifted.exp()?.sum_keepdim(D::Minus1)?.log()?;
    shifted.broadcast_sub(&log_sum_exp)
}

/// Fail if `tensor` holds any NaN or infinity.
///
/// `x - x` is zero for finite x and NaN otherwise, and a single NaN poisons
/// the sum, so one scalar read covers the whole tensor.
pub fn ensure_finite(stage: &str, tensor: &Tensor) -> ForecastResult<()> {
    let probe = tensor.detach();
    let probe = probe
        .sub(&probe)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    if probe.is_finite() {
        Ok(())
    } else {
        Err(ForecastError::numerical(
            stage,
            format!("non-finite value in tensor with dims {:?}", tensor.dims()),
        ))
    }
}

//! Individual uncertainty: independent Laplace scales per agent, mode, step and axis.

use candle_core::{Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::ForecastConfig;
use crate::error::ForecastResult;
use crate::layers::{linear_nd, ResidualBlock};
use crate::transforms::positive_scale;

/// Head producing `(B, N, K, T, 2)` Laplace scales from the mode features.
pub struct IndividualHead {
    block: ResidualBlock,
    out: Linear,
    horizon: usize,
    per_step: bool,
    scale_floor: f64,
}

impl IndividualHead {
    pub fn new(config: &ForecastConfig, vb: VarBuilder) -> ForecastResult<Self> {
        config.validate()?;
        let d = config.embed_dim;
        Ok(Self {
            block: ResidualBlock::new(d, config.layer_norm_eps, vb.pp("res"))?,
            out: candle_nn::linear(d, config.scales_per_mode(), vb.pp("out"))?,
            horizon: config.horizon,
            per_step: config.per_step_scale,
            scale_floor: config.scale_floor,
        })
    }

    /// Raw pre-activation scale values, `(B, N, K, T*2)` or `(B, N, K, 2)`.
    pub fn raw(&self, mode_features: &Tensor) -> Result<Tensor> {
        linear_nd(&self.out, &self.block.forward(mode_features)?)
    }

    /// Scales for every mode, each `>= scale_floor`.
    /// Input: (B, N, K, D)
    pub fn forward(&self, mode_features: &Tensor) -> ForecastResult<Tensor> {
        let (b, n, k, _) = mode_features.dims4()?;
        let raw = self.raw(mode_features)?;
        let raw = if self.per_step {
            raw.reshape((b, n, k, self.horizon, 2))?
        } else {
            raw.reshape((b, n, k, 1, 2))?
                .broadcast_as((b, n, k, self.horizon, 2))?
                .contiguous()?
        };
        positive_scale(&raw, self.scale_floor)
    }
}

/// Elementwise Laplace negative log-likelihood `|e|/b + log(2b)`.
pub fn laplace_nll(error: &Tensor, scale: &Tensor) -> Result<Tensor> {
    let residual = error.abs()?.div(scale)?;
    residual + (scale * 2.0)?.log()?
}

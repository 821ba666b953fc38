//! Building blocks shared by the heads.
//!
//! Normalization is written with basic tensor ops (mean, sub, sqrt, div) so
//! the heads run on any candle backend, including CUDA builds where the fused
//! layer-norm kernel is unavailable.

use candle_core::{Result, Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};

/// Layer normalization over the last dimension.
///
/// y = (x - mean(x)) / sqrt(var(x) + eps) * weight + bias
#[derive(Debug, Clone)]
pub struct FeatureNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl FeatureNorm {
    /// Create the norm with unit weight and zero bias.
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", candle_nn::Init::Const(1.0))?;
        let bias = vb.get_with_hints(size, "bias", candle_nn::Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }
}

impl Module for FeatureNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let std = (var + self.eps)?.sqrt()?;
        centered
            .broadcast_div(&std)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// Apply a linear layer to a tensor of any rank by folding the leading dims.
pub fn linear_nd(layer: &Linear, x: &Tensor) -> Result<Tensor> {
    let dims = x.dims().to_vec();
    let (lead, last) = dims.split_at(dims.len() - 1);
    let rows: usize = lead.iter().product();
    let out = layer.forward(&x.reshape((rows, last[0]))?)?;
    let mut out_dims = lead.to_vec();
    out_dims.push(out.dim(1)?);
    out.reshape(out_dims)
}

/// Residual MLP block: relu(x + norm(W2 relu(norm(W1 x)))).
pub struct ResidualBlock {
    fc1: Linear,
    norm1: FeatureNorm,
    fc2: Linear,
    norm2: FeatureNorm,
}

impl ResidualBlock {
    /// Create a width-preserving block.
    pub fn new(width: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: candle_nn::linear_no_bias(width, width, vb.pp("fc1"))?,
            norm1: FeatureNorm::new(width, eps, vb.pp("norm1"))?,
            fc2: candle_nn::linear_no_bias(width, width, vb.pp("fc2"))?,
            norm2: FeatureNorm::new(width, eps, vb.pp("norm2"))?,
        })
    }

    /// Forward pass over `(..., width)`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.norm1.forward(&linear_nd(&self.fc1, x)?)?.relu()?;
        let h = self.norm2.forward(&linear_nd(&self.fc2, &h)?)?;
        (x + h)?.relu()
    }
}

/// Stack of residual blocks.
pub struct ResidualStack {
    blocks: Vec<ResidualBlock>,
}

impl ResidualStack {
    pub fn new(width: usize, depth: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let blocks = (0..depth)
            .map(|i| ResidualBlock::new(width, eps, vb.pp(format!("blocks.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { blocks })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.blocks
            .iter()
            .try_fold(x.clone(), |h, block| block.forward(&h))
    }
}

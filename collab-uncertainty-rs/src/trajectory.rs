//! Multi-modal trajectory head and winner-takes-all mode selection.
//!
//! Each of the K modes has its own residual regression branch. The endpoint of
//! every hypothesis is encoded and fused with the agent embedding into a
//! per-mode feature, which drives both the confidence logit and the
//! uncertainty heads downstream.

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{Linear, VarBuilder};

use crate::config::{ForecastConfig, WinnerCriterion};
use crate::error::ForecastResult;
use crate::layers::{linear_nd, ResidualStack};
use crate::transforms::stable_softmax_last_dim;

/// One regression branch: residual stack then a projection to `2T` values.
struct ModeBranch {
    stack: ResidualStack,
    out: Linear,
}

impl ModeBranch {
    fn new(config: &ForecastConfig, vb: VarBuilder) -> Result<Self> {
        let d = config.embed_dim;
        Ok(Self {
            stack: ResidualStack::new(d, config.num_res_blocks, config.layer_norm_eps, vb.pp("res"))?,
            out: candle_nn::linear(d, 2 * config.horizon, vb.pp("out"))?,
        })
    }

    fn forward(&self, embeddings: &Tensor) -> Result<Tensor> {
        linear_nd(&self.out, &self.stack.forward(embeddings)?)
    }
}

/// Output of the trajectory head for a padded batch.
#[derive(Debug, Clone)]
pub struct TrajectoryOutput {
    /// `(B, N, K, T, 2)` displacements from each agent's current position
    pub trajectories: Tensor,
    /// `(B, N, K)` raw confidence logits
    pub logits: Tensor,
    /// `(B, N, K)` softmax of `logits` over modes
    pub confidences: Tensor,
    /// `(B, N, K, D)` fused agent/endpoint features per mode
    pub mode_features: Tensor,
}

/// Trajectory hypotheses plus mode confidences.
pub struct TrajectoryHead {
    branches: Vec<ModeBranch>,
    dest_in: Linear,
    dest_out: Linear,
    fuse: Linear,
    logit: Linear,
    horizon: usize,
}

impl TrajectoryHead {
    pub fn new(config: &ForecastConfig, vb: VarBuilder) -> ForecastResult<Self> {
        config.validate()?;
        let d = config.embed_dim;
        let branches = (0..config.num_modes)
            .map(|k| ModeBranch::new(config, vb.pp(format!("modes.{k}"))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            branches,
            dest_in: candle_nn::linear(2, d, vb.pp("dest_in"))?,
            dest_out: candle_nn::linear(d, d, vb.pp("dest_out"))?,
            fuse: candle_nn::linear(2 * d, d, vb.pp("fuse"))?,
            logit: candle_nn::linear(d, 1, vb.pp("logit"))?,
            horizon: config.horizon,
        })
    }

    pub fn num_modes(&self) -> usize {
        self.branches.len()
    }

    /// Forward pass.
    /// Input: (B, N, D)
    pub fn forward(&self, embeddings: &Tensor) -> Result<TrajectoryOutput> {
        let (b, n, d) = embeddings.dims3()?;
        let k = self.num_modes();

        let modes = self
            .branches
            .iter()
            .map(|branch| branch.forward(embeddings)?.reshape((b, n, 1, self.horizon, 2)))
            .collect::<Result<Vec<_>>>()?;
        let trajectories = Tensor::cat(&modes, 2)?;

        // Endpoints are conditioning only; confidence must not move the regression.
        let endpoints = trajectories
            .narrow(3, self.horizon - 1, 1)?
            .squeeze(3)?
            .detach();
        let dest = linear_nd(&self.dest_in, &endpoints)?.relu()?;
        let dest = linear_nd(&self.dest_out, &dest)?.relu()?;

        let agent = embeddings.unsqueeze(2)?.broadcast_as((b, n, k, d))?.contiguous()?;
        let mode_features = linear_nd(&self.fuse, &Tensor::cat(&[&dest, &agent], 3)?)?.relu()?;

        let logits = linear_nd(&self.logit, &mode_features)?.squeeze(3)?;
        let confidences = stable_softmax_last_dim(&logits)?;

        Ok(TrajectoryOutput {
            trajectories,
            logits,
            confidences,
            mode_features,
        })
    }
}

/// Per-mode displacement errors against ground truth, measured on detached tensors.
#[derive(Debug, Clone)]
pub struct DisplacementErrors {
    /// `(B, N, K)` sum of Euclidean errors over valid steps
    pub total: Tensor,
    /// `(B, N, K)` Euclidean error at each agent's last valid step
    pub final_step: Tensor,
}

impl DisplacementErrors {
    /// * `trajectories` - `(B, N, K, T, 2)`
    /// * `future` - `(B, N, T, 2)`
    /// * `valid_steps` - `(B, N, T)`
    pub fn compute(trajectories: &Tensor, future: &Tensor, valid_steps: &Tensor) -> Result<Self> {
        let (_, _, _, t, _) = trajectories.dims5()?;
        let diff = trajectories.detach().broadcast_sub(&future.detach().unsqueeze(2)?)?;
        let dist = diff.sqr()?.sum(D::Minus1)?.sqrt()?;

        let valid = valid_steps.unsqueeze(2)?;
        let total = dist.broadcast_mul(&valid)?.sum(3)?;

        // valid + 0.1 t/T peaks at the last valid step, uniquely
        let ramp = (Tensor::arange(0f32, t as f32, valid_steps.device())? * (0.1 / t as f64))?;
        let last = valid_steps.broadcast_add(&ramp)?.argmax(D::Minus1)?;
        let last = one_hot(&last, t, valid_steps.device())?.unsqueeze(2)?;
        let final_step = dist.broadcast_mul(&last)?.sum(3)?;

        Ok(Self { total, final_step })
    }

    /// Errors used for winner selection under `criterion`.
    pub fn for_criterion(&self, criterion: WinnerCriterion) -> &Tensor {
        match criterion {
            WinnerCriterion::AverageDisplacement => &self.total,
            WinnerCriterion::FinalDisplacement => &self.final_step,
        }
    }
}

/// Winner-takes-all selection.
#[derive(Debug, Clone)]
pub struct WinnerSelection {
    /// `(B, N)` u32 winning mode per agent
    pub indices: Tensor,
    /// `(B, N, K)` f32 one-hot of `indices`
    pub one_hot: Tensor,
}

impl WinnerSelection {
    /// Pick the minimum-cost mode per agent; ties go to the lowest index.
    ///
    /// Every minimal entry is scored `K - k` and the arg-max of that score is
    /// unique, so the result never depends on reduction order.
    pub fn from_costs(costs: &Tensor) -> Result<Self> {
        let (_, _, k) = costs.dims3()?;
        let device = costs.device();
        let is_min = costs
            .broadcast_eq(&costs.min_keepdim(D::Minus1)?)?
            .to_dtype(DType::F32)?;
        let rank: Vec<f32> = (0..k).map(|i| (k - i) as f32).collect();
        let rank = Tensor::from_vec(rank, k, device)?;
        let indices = is_min.broadcast_mul(&rank)?.argmax(D::Minus1)?;
        let one_hot = one_hot(&indices, k, device)?;
        Ok(Self { indices, one_hot })
    }

    /// Pick the highest-scoring mode per agent; ties go to the lowest index.
    pub fn from_scores(scores: &Tensor) -> Result<Self> {
        Self::from_costs(&scores.neg()?)
    }
}

/// `(…)` u32 indices to a `(…, size)` f32 one-hot.
pub fn one_hot(indices: &Tensor, size: usize, device: &Device) -> Result<Tensor> {
    let classes = Tensor::arange(0u32, size as u32, device)?;
    indices
        .unsqueeze(D::Minus1)?
        .broadcast_eq(&classes)?
        .to_dtype(DType::F32)
}

/// Reduce the mode axis (dim 2) of `x` with a `(B, N, K)` weight, e.g. a one-hot.
///
/// `(B, N, K, ...)` -> `(B, N, ...)`
pub fn select_mode(x: &Tensor, weights: &Tensor) -> Result<Tensor> {
    let mut dims = weights.dims().to_vec();
    dims.resize(x.rank(), 1);
    x.broadcast_mul(&weights.reshape(dims)?)?.sum(2)
}

//! Winner-takes-all loss: mode classification plus Laplace regression, with
//! the optional cross-agent coupling terms.
//!
//! Every scene contributes the mean of its terms over its valid
//! `(agent, step)` pairs; scenes are then averaged. Scenes without any valid
//! pair are skipped and reported, not treated as errors.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::batch::GroundTruth;
use crate::collaborative::CouplingStructure;
use crate::config::{ClassificationLoss, ForecastConfig};
use crate::error::{expect_dims, ForecastError, ForecastResult};
use crate::individual::laplace_nll;
use crate::model::ForecastOutput;
use crate::trajectory::{select_mode, DisplacementErrors, WinnerSelection};
use crate::transforms::{ensure_finite, stable_log_softmax_last_dim};

/// Scalar summary of one loss evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossBreakdown {
    /// `cls_weight * classification + reg_weight * regression`
    pub total: f32,
    /// Mean classification loss over non-degenerate scenes
    pub classification: f32,
    /// Mean regression NLL over non-degenerate scenes, coupling included
    pub regression: f32,
    /// Share of `regression` coming from the coupling terms (0 for IU)
    pub coupling: f32,
    /// Agents with at least one supervised step
    pub valid_agents: usize,
    /// Batch rows that had no supervised step and were skipped
    pub degenerate_scenes: Vec<usize>,
}

/// Result of [`LossAggregator::compute`].
#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Differentiable scalar loss
    pub total: Tensor,
    pub breakdown: LossBreakdown,
    /// Winner mode per agent used for supervision
    pub winner: WinnerSelection,
}

/// Combines classification and regression into the training objective.
#[derive(Debug, Clone)]
pub struct LossAggregator {
    config: ForecastConfig,
}

impl LossAggregator {
    pub fn new(config: &ForecastConfig) -> ForecastResult<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.config
    }

    /// Compute the loss for a padded batch.
    ///
    /// The coupling terms are added whenever `output` carries coupling
    /// parameters; use [`crate::UncertaintyParams::as_individual`] to score
    /// the same output without them.
    ///
    /// # Errors
    ///
    /// * [`ForecastError::ShapeMismatch`] if any input disagrees on `B, N, K, T`
    /// * [`ForecastError::NumericalInstability`] if the total is not finite
    pub fn compute(
        &self,
        output: &ForecastOutput,
        ground_truth: &GroundTruth,
        agent_mask: &Tensor,
    ) -> ForecastResult<LossOutput> {
        let _span = tracing::debug_span!("forecast_loss").entered();
        let (b, n, _, t) = output.dims()?;
        output.check_consistent()?;
        expect_dims("agent mask", agent_mask, &[b, n])?;
        expect_dims("ground truth", &ground_truth.future, &[b, n, t, 2])?;

        let valid = ground_truth.valid_steps(agent_mask)?;
        let future = ground_truth.supervised_future(&valid)?;
        let errors = DisplacementErrors::compute(&output.trajectories, &future, &valid)?;
        let winner = WinnerSelection::from_costs(errors.for_criterion(self.config.winner))?;

        let step_weights = self.step_weights(t, valid.device())?;
        let (laplace, coupling) = self.regression_sums(output, &future, &valid, &winner, &step_weights)?;

        let pairs = valid.sum((1, 2))?;
        let per_pair = pairs.maximum(1.0)?;
        let regression = (laplace + &coupling)?.div(&per_pair)?;
        let coupling = coupling.div(&per_pair)?;

        let active = valid.sum(2)?.gt(0.0)?.to_dtype(DType::F32)?;
        let classification = self.classification(output, &errors, &winner, &active)?;

        // Scene averaging over rows with at least one supervised pair
        let scene_valid = pairs.gt(0.0)?.to_dtype(DType::F32)?;
        let num_valid = scene_valid.sum_all()?.to_scalar::<f32>()?;
        let denom = f64::from(num_valid.max(1.0));
        let scene_mean = |x: &Tensor| -> candle_core::Result<Tensor> { x.mul(&scene_valid)?.sum_all()? / denom };

        let classification = scene_mean(&classification)?;
        let regression = scene_mean(&regression)?;
        let coupling = scene_mean(&coupling)?;
        let total = ((&classification * self.config.cls_weight)? + (&regression * self.config.reg_weight)?)?;
        ensure_finite("loss", &total)?;

        let degenerate_scenes: Vec<usize> = pairs
            .to_vec1::<f32>()?
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0.0)
            .map(|(row, _)| row)
            .collect();
        if !degenerate_scenes.is_empty() {
            tracing::warn!(
                scenes = ?degenerate_scenes,
                "skipping scenes without any valid agent"
            );
        }

        let breakdown = LossBreakdown {
            total: total.to_scalar::<f32>()?,
            classification: classification.to_scalar::<f32>()?,
            regression: regression.to_scalar::<f32>()?,
            coupling: coupling.to_scalar::<f32>()?,
            valid_agents: active.sum_all()?.to_scalar::<f32>()? as usize,
            degenerate_scenes,
        };
        tracing::debug!(
            total = breakdown.total,
            cls = breakdown.classification,
            reg = breakdown.regression,
            coupling = breakdown.coupling,
            agents = breakdown.valid_agents,
            "loss"
        );

        Ok(LossOutput {
            total,
            breakdown,
            winner,
        })
    }

    /// `(T)` per-step weights, the last step boosted by `final_step_weight`.
    fn step_weights(&self, horizon: usize, device: &candle_core::Device) -> ForecastResult<Tensor> {
        let mut weights = vec![1.0f32; horizon];
        if let Some(last) = weights.last_mut() {
            *last += self.config.final_step_weight as f32;
        }
        Ok(Tensor::from_vec(weights, horizon, device)?)
    }

    /// Per-scene sums of the Laplace terms and of the coupling terms, each `(B)`.
    fn regression_sums(
        &self,
        output: &ForecastOutput,
        future: &Tensor,
        valid: &Tensor,
        winner: &WinnerSelection,
        step_weights: &Tensor,
    ) -> ForecastResult<(Tensor, Tensor)> {
        let (b, _, _, t) = output.dims()?;
        let scales = select_mode(&output.uncertainty.scales, &winner.one_hot)?;
        let predicted = select_mode(&output.trajectories, &winner.one_hot)?;
        let error = (predicted - future)?;

        let valid = valid.unsqueeze(3)?;
        let weights = valid.broadcast_mul(&step_weights.reshape((1, 1, t, 1))?)?;
        let laplace = laplace_nll(&error, &scales)?.broadcast_mul(&weights)?.sum((1, 2, 3))?;

        let coupling = match &output.uncertainty.coupling {
            None => Tensor::zeros(b, DType::F32, error.device())?,
            Some(params) => {
                let (factors, gates) = params.select(&winner.one_hot)?;
                let structure =
                    CouplingStructure::build(&factors, &gates, &valid.squeeze(3)?, self.config.coupling_ridge)?;

                // u = sqrt(r + δ) - sqrt(δ), zero at zero error and on invalid pairs
                let delta = self.config.cross_smoothing;
                let residual = error.abs()?.div(&scales)?;
                let u = ((residual + delta)?.sqrt()? - delta.sqrt())?.broadcast_mul(&valid)?;
                let u = u.permute((0, 2, 1, 3))?.contiguous()?;

                // -½ log det P_t per axis, two axes
                let cross = structure.cross_term(&u)?.sum(2)?;
                let per_step = (cross - structure.log_det()?)?;
                per_step.broadcast_mul(step_weights)?.sum(1)?
            }
        };
        Ok((laplace, coupling))
    }

    /// Per-scene classification loss `(B)`.
    fn classification(
        &self,
        output: &ForecastOutput,
        errors: &DisplacementErrors,
        winner: &WinnerSelection,
        active: &Tensor,
    ) -> ForecastResult<Tensor> {
        let per_scene = match self.config.classification {
            ClassificationLoss::CrossEntropy => {
                let log_p = stable_log_softmax_last_dim(&output.logits)?;
                let nll = log_p.mul(&winner.one_hot)?.sum(2)?.neg()?;
                nll.mul(active)?.sum(1)?.div(&active.sum(1)?.maximum(1.0)?)?
            }
            ClassificationLoss::MaxMargin {
                margin,
                threshold,
                ignore,
            } => {
                // ranked by final error, whatever criterion picked the regression winner
                let closest = WinnerSelection::from_costs(&errors.final_step)?;
                let best = select_mode(&errors.final_step, &closest.one_hot)?;
                let eligible = best.lt(threshold)?.to_dtype(DType::F32)?.mul(active)?;
                let competing = errors
                    .final_step
                    .broadcast_sub(&best.unsqueeze(2)?)?
                    .gt(ignore)?
                    .to_dtype(DType::F32)?;
                let pairs = competing.broadcast_mul(&eligible.unsqueeze(2)?)?;

                // margin - (logit_w - logit_k), kept where positive
                let winner_logit = select_mode(&output.logits, &closest.one_hot)?;
                let hinge = (output.logits.broadcast_sub(&winner_logit.unsqueeze(2)?)? + margin)?.relu()?;
                let count = pairs.sum((1, 2))?.maximum(1.0)?;
                hinge.mul(&pairs)?.sum((1, 2))?.div(&count)?
            }
        };
        if per_scene.rank() != 1 {
            return Err(ForecastError::shape_mismatch(
                "per-scene classification (B)",
                format!("{:?}", per_scene.dims()),
            ));
        }
        Ok(per_scene)
    }
}

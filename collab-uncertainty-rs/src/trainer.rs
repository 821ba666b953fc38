//! Single-process training step: forward, loss, AdamW update.
//!
//! Batching, data loading and multi-worker orchestration live outside this
//! crate. The trainer only owns the model and its optimizer state.

use candle_nn::{Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};

use crate::batch::SceneBatch;
use crate::error::{ForecastError, ForecastResult};
use crate::loss::LossBreakdown;
use crate::model::ForecastModel;

/// Optimizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Weight decay
    pub weight_decay: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 1e-4,
            eps: 1e-8,
        }
    }
}

impl TrainerConfig {
    /// Set the learning rate.
    #[must_use]
    pub const fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    fn adamw_params(&self) -> ParamsAdamW {
        ParamsAdamW {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: self.weight_decay,
        }
    }
}

/// Metrics from one optimizer step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMetrics {
    /// 1-based step counter
    pub step: usize,
    pub loss: LossBreakdown,
    pub learning_rate: f64,
}

/// Owns a model and an AdamW optimizer over all of its parameters.
pub struct ForecastTrainer {
    model: ForecastModel,
    optimizer: candle_nn::AdamW,
    step: usize,
}

impl ForecastTrainer {
    pub fn new(model: ForecastModel, config: &TrainerConfig) -> ForecastResult<Self> {
        let vars = model.var_map().all_vars();
        let optimizer = candle_nn::AdamW::new(vars, config.adamw_params())?;
        tracing::debug!(
            lr = config.learning_rate,
            params = model.num_parameters(),
            "initialized AdamW"
        );
        Ok(Self {
            model,
            optimizer,
            step: 0,
        })
    }

    /// One forward/backward/update on a batch with ground truth.
    ///
    /// # Errors
    ///
    /// [`ForecastError::Batch`] if the batch carries no ground truth; any
    /// shape or numerical error from the forward pass or the loss.
    pub fn train_step(&mut self, batch: &SceneBatch) -> ForecastResult<StepMetrics> {
        let ground_truth = batch
            .ground_truth
            .as_ref()
            .ok_or_else(|| ForecastError::batch("training batch without ground truth"))?;

        let output = self.model.forward(&batch.embeddings, &batch.agent_mask)?;
        let loss = self.model.loss(&output, ground_truth, &batch.agent_mask)?;
        self.optimizer.backward_step(&loss.total)?;
        self.step += 1;

        let metrics = StepMetrics {
            step: self.step,
            loss: loss.breakdown,
            learning_rate: self.optimizer.learning_rate(),
        };
        tracing::debug!(
            step = metrics.step,
            loss = metrics.loss.total,
            cls = metrics.loss.classification,
            reg = metrics.loss.regression,
            "train step"
        );
        Ok(metrics)
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr);
    }

    pub fn steps(&self) -> usize {
        self.step
    }

    pub fn model(&self) -> &ForecastModel {
        &self.model
    }

    pub fn into_model(self) -> ForecastModel {
        self.model
    }
}

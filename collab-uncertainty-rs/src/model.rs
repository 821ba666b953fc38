//! The forecasting model: trajectory head plus the IU or CU uncertainty head.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::batch::GroundTruth;
use crate::calibration::{Calibration, CalibrationConfig, Calibrator};
use crate::collaborative::{CollaborativeHead, CouplingParams};
use crate::config::ForecastConfig;
use crate::error::{expect_dims, ForecastError, ForecastResult};
use crate::individual::IndividualHead;
use crate::loss::{LossAggregator, LossOutput};
use crate::trajectory::TrajectoryHead;
use crate::transforms::ensure_finite;

/// Uncertainty parameters for every mode.
#[derive(Debug, Clone)]
pub struct UncertaintyParams {
    /// `(B, N, K, T, 2)` Laplace scales, all `>= scale_floor`
    pub scales: Tensor,
    /// Cross-agent coupling, present in collaborative mode
    pub coupling: Option<CouplingParams>,
}

impl UncertaintyParams {
    /// The same scales without coupling.
    pub fn as_individual(&self) -> Self {
        Self {
            scales: self.scales.clone(),
            coupling: None,
        }
    }

    pub fn is_collaborative(&self) -> bool {
        self.coupling.is_some()
    }
}

/// Output of [`ForecastModel::forward`].
#[derive(Debug, Clone)]
pub struct ForecastOutput {
    /// `(B, N, K, T, 2)` displacements in the scene frame
    pub trajectories: Tensor,
    /// `(B, N, K)` confidence logits
    pub logits: Tensor,
    /// `(B, N, K)` confidences, summing to 1 per agent
    pub confidences: Tensor,
    /// `(B, N, K, D)` per-mode features
    pub mode_features: Tensor,
    pub uncertainty: UncertaintyParams,
}

impl ForecastOutput {
    /// `(B, N, K, T)`
    pub fn dims(&self) -> ForecastResult<(usize, usize, usize, usize)> {
        let (b, n, k, t, two) = self.trajectories.dims5()?;
        if two != 2 {
            return Err(ForecastError::shape_mismatch(
                "trajectories (B, N, K, T, 2)",
                format!("{:?}", self.trajectories.dims()),
            ));
        }
        Ok((b, n, k, t))
    }

    /// Check that every field agrees on `B, N, K, T`.
    pub fn check_consistent(&self) -> ForecastResult<()> {
        let (b, n, k, t) = self.dims()?;
        expect_dims("logits", &self.logits, &[b, n, k])?;
        expect_dims("confidences", &self.confidences, &[b, n, k])?;
        expect_dims("scales", &self.uncertainty.scales, &[b, n, k, t, 2])?;
        if self.mode_features.dims().get(..3) != Some(&[b, n, k][..]) {
            return Err(ForecastError::shape_mismatch(
                format!("mode features ({b}, {n}, {k}, D)"),
                format!("{:?}", self.mode_features.dims()),
            ));
        }
        if let Some(coupling) = &self.uncertainty.coupling {
            expect_dims("coupling gates", &coupling.gates, &[b, n, k, t])?;
            let (fb, fn_, fk, _) = coupling.factors.dims4()?;
            if (fb, fn_, fk) != (b, n, k) {
                return Err(ForecastError::shape_mismatch(
                    format!("coupling factors ({b}, {n}, {k}, R)"),
                    format!("{:?}", coupling.factors.dims()),
                ));
            }
        }
        Ok(())
    }
}

/// Multi-modal forecaster over padded scene batches.
pub struct ForecastModel {
    trajectory: TrajectoryHead,
    individual: IndividualHead,
    collaborative: Option<CollaborativeHead>,
    loss: LossAggregator,
    config: ForecastConfig,
    device: Device,
    /// VarMap for accessing parameters
    var_map: VarMap,
}

impl ForecastModel {
    /// Create a new model with random initialization
    pub fn new(config: &ForecastConfig, device: &Device) -> ForecastResult<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);

        Self::from_varbuilder(config, vb, device, var_map)
    }

    /// Create the model from a VarBuilder.
    ///
    /// The collaborative head is only built in collaborative mode, so an IU
    /// model carries no coupling parameters at all.
    pub fn from_varbuilder(
        config: &ForecastConfig,
        vb: VarBuilder,
        device: &Device,
        var_map: VarMap,
    ) -> ForecastResult<Self> {
        config.validate()?;

        let trajectory = TrajectoryHead::new(config, vb.pp("trajectory"))?;
        let individual = IndividualHead::new(config, vb.pp("scale"))?;
        let collaborative = if config.is_collaborative() {
            Some(CollaborativeHead::new(config, vb.pp("coupling"))?)
        } else {
            None
        };

        tracing::debug!(
            modes = config.num_modes,
            horizon = config.horizon,
            head_mode = ?config.head_mode,
            "built forecast model"
        );

        Ok(Self {
            trajectory,
            individual,
            collaborative,
            loss: LossAggregator::new(config)?,
            config: config.clone(),
            device: device.clone(),
            var_map,
        })
    }

    /// Forward pass.
    ///
    /// * `embeddings` - `(B, N, D)` fused per-agent features
    /// * `agent_mask` - `(B, N)` 1.0 for real agents
    ///
    /// Padding rows are replaced by zeros before the heads run, so whatever the
    /// encoder left there, NaN included, cannot leak into the outputs.
    ///
    /// # Errors
    ///
    /// [`ForecastError::NumericalInstability`] if a real agent's embedding
    /// drives any head output to a non-finite value.
    pub fn forward(&self, embeddings: &Tensor, agent_mask: &Tensor) -> ForecastResult<ForecastOutput> {
        let _span = tracing::debug_span!("forecast_forward").entered();
        let (b, n, d) = embeddings.dims3()?;
        if d != self.config.embed_dim {
            return Err(ForecastError::shape_mismatch(
                format!("embeddings (B, N, {})", self.config.embed_dim),
                format!("{:?}", embeddings.dims()),
            ));
        }
        expect_dims("agent mask", agent_mask, &[b, n])?;

        let keep = agent_mask
            .to_dtype(DType::F32)?
            .gt(0.0)?
            .unsqueeze(2)?
            .broadcast_as((b, n, d))?
            .contiguous()?;
        let embeddings = keep.where_cond(embeddings, &embeddings.zeros_like()?)?;

        let heads = self.trajectory.forward(&embeddings)?;
        ensure_finite("trajectory_head", &heads.trajectories)?;
        ensure_finite("confidence", &heads.confidences)?;

        let scales = self.individual.forward(&heads.mode_features)?;
        let coupling = self
            .collaborative
            .as_ref()
            .map(|head| head.forward(&heads.mode_features))
            .transpose()?;

        Ok(ForecastOutput {
            trajectories: heads.trajectories,
            logits: heads.logits,
            confidences: heads.confidences,
            mode_features: heads.mode_features,
            uncertainty: UncertaintyParams { scales, coupling },
        })
    }

    /// Training loss for a forward output.
    pub fn loss(
        &self,
        output: &ForecastOutput,
        ground_truth: &GroundTruth,
        agent_mask: &Tensor,
    ) -> ForecastResult<LossOutput> {
        self.loss.compute(output, ground_truth, agent_mask)
    }

    /// Calibrated point estimate, intervals and blend at `quantile`.
    pub fn calibrate(&self, output: &ForecastOutput, agent_mask: &Tensor, quantile: f64) -> ForecastResult<Calibration> {
        Calibrator::new(CalibrationConfig::new(quantile), &self.config)?.calibrate(output, agent_mask)
    }

    /// Save parameters in safetensors format.
    pub fn save(&self, path: impl AsRef<Path>) -> ForecastResult<()> {
        self.var_map.save(path)?;
        Ok(())
    }

    /// Build a model for `config` and overwrite its parameters from `path`.
    pub fn load(config: &ForecastConfig, path: impl AsRef<Path>, device: &Device) -> ForecastResult<Self> {
        let mut model = Self::new(config, device)?;
        model.var_map.load(path)?;
        Ok(model)
    }

    /// Get reference to VarMap for gradient computation
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Total number of scalar parameters.
    pub fn num_parameters(&self) -> usize {
        self.var_map
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum()
    }
}

//! Inference-time summaries of a forecast: point estimate, confidence
//! regions, uncertainty-weighted blend and the mapping back to world frame.
//!
//! Nothing here touches parameters or gradients; every input is detached.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::collaborative::CouplingStructure;
use crate::config::ForecastConfig;
use crate::error::{expect_dims, ForecastError, ForecastResult};
use crate::model::ForecastOutput;
use crate::trajectory::{select_mode, WinnerSelection};

/// Calibration settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Central coverage of the reported intervals, in (0, 1)
    pub quantile: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self { quantile: 0.9 }
    }
}

impl CalibrationConfig {
    pub fn new(quantile: f64) -> Self {
        Self { quantile }
    }

    pub fn validate(&self) -> ForecastResult<()> {
        if !(self.quantile > 0.0 && self.quantile < 1.0) {
            return Err(ForecastError::invalid_config(format!(
                "quantile must lie in (0, 1), got {}",
                self.quantile
            )));
        }
        Ok(())
    }

    /// Laplace quantile multiplier: `P(|X| <= b m) = q` for `m = ln(1/(1-q))`.
    pub fn laplace_multiplier(&self) -> f64 {
        (1.0 / (1.0 - self.quantile)).ln()
    }
}

/// Per-mode interval half-widths around each predicted point.
#[derive(Debug, Clone)]
pub struct ConfidenceRegion {
    /// `(B, N, K, T, 2)` half-width per axis
    pub half_width: Tensor,
    pub quantile: f64,
}

/// Everything [`Calibrator::calibrate`] reports.
#[derive(Debug, Clone)]
pub struct Calibration {
    /// `(B, N, T, 2)` trajectory of the most confident mode
    pub point_estimate: Tensor,
    pub confidence_region: ConfidenceRegion,
    /// `(B, N, T, 2)` uncertainty-weighted mode average
    pub blended: Tensor,
}

/// Turns a forecast into calibrated, user-facing outputs.
#[derive(Debug, Clone)]
pub struct Calibrator {
    config: CalibrationConfig,
    coupling_ridge: f64,
}

impl Calibrator {
    pub fn new(config: CalibrationConfig, forecast: &ForecastConfig) -> ForecastResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            coupling_ridge: forecast.coupling_ridge,
        })
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Point estimate, confidence region and blend in one call.
    pub fn calibrate(&self, output: &ForecastOutput, agent_mask: &Tensor) -> ForecastResult<Calibration> {
        Ok(Calibration {
            point_estimate: self.point_estimate(output)?,
            confidence_region: self.confidence_region(output, agent_mask)?,
            blended: self.blend(output)?,
        })
    }

    /// Trajectory of the highest-confidence mode; ties go to the lowest index.
    pub fn point_estimate(&self, output: &ForecastOutput) -> ForecastResult<Tensor> {
        let best = WinnerSelection::from_scores(&output.confidences.detach())?;
        Ok(select_mode(&output.trajectories.detach(), &best.one_hot)?)
    }

    /// Half-widths of the central `quantile` interval for every mode.
    ///
    /// With coupling, each scale is inflated by `sqrt((P_t⁻¹)_ii)`, the
    /// marginal widening that agent `i` inherits from its neighbours.
    pub fn confidence_region(&self, output: &ForecastOutput, agent_mask: &Tensor) -> ForecastResult<ConfidenceRegion> {
        let (b, n, k, t) = output.dims()?;
        expect_dims("agent mask", agent_mask, &[b, n])?;
        let scales = output.uncertainty.scales.detach();
        let base = (scales * self.config.laplace_multiplier())?;

        let half_width = match &output.uncertainty.coupling {
            None => base,
            Some(params) => {
                let (factors, gates) = params.fold_modes()?;
                let valid = agent_mask
                    .to_dtype(DType::F32)?
                    .unsqueeze(1)?
                    .unsqueeze(3)?
                    .broadcast_as((b, k, n, t))?
                    .reshape((b * k, n, t))?;
                let structure =
                    CouplingStructure::build(&factors.detach(), &gates.detach(), &valid, self.coupling_ridge)?;
                // (B*K, T, N) -> (B, N, K, T, 1)
                let inflation = structure
                    .marginal_inflation()?
                    .reshape((b, k, t, n))?
                    .permute((0, 3, 1, 2))?
                    .unsqueeze(4)?;
                base.broadcast_mul(&inflation)?
            }
        };

        Ok(ConfidenceRegion {
            half_width,
            quantile: self.config.quantile,
        })
    }

    /// Average of the modes weighted by `p_k / mean(b_k)`, normalized per agent.
    pub fn blend(&self, output: &ForecastOutput) -> ForecastResult<Tensor> {
        let spread = output.uncertainty.scales.detach().mean((3, 4))?;
        let weights = output.confidences.detach().div(&spread)?;
        let weights = weights.broadcast_div(&weights.sum_keepdim(2)?)?;
        Ok(select_mode(&output.trajectories.detach(), &weights)?)
    }
}

/// Mode indices per agent sorted by descending confidence, `(B, N, K)` u32.
pub fn ranked_modes(output: &ForecastOutput) -> ForecastResult<Tensor> {
    Ok(output.confidences.detach().arg_sort_last_dim(false)?)
}

/// Map scene-frame trajectories to world coordinates, `x @ rotation + origin`.
///
/// * `trajectories` - `(B, ..., 2)`, e.g. `(B, N, K, T, 2)` or `(B, N, T, 2)`
/// * `rotation` - `(B, 2, 2)` per scene
/// * `origin` - `(B, 2)` per scene
pub fn to_world(trajectories: &Tensor, rotation: &Tensor, origin: &Tensor) -> ForecastResult<Tensor> {
    let dims = trajectories.dims().to_vec();
    if dims.len() < 2 || dims[dims.len() - 1] != 2 {
        return Err(ForecastError::shape_mismatch("(B, ..., 2)", format!("{dims:?}")));
    }
    let b = dims[0];
    expect_dims("rotation", rotation, &[b, 2, 2])?;
    expect_dims("origin", origin, &[b, 2])?;

    let points: usize = dims[1..dims.len() - 1].iter().product();
    let flat = trajectories.reshape((b, points, 2))?;
    let world = flat.matmul(rotation)?.broadcast_add(&origin.unsqueeze(1)?)?;
    Ok(world.reshape(dims)?)
}

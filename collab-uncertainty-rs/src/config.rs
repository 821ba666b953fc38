//! Configuration for the forecasting heads and the loss.
//!
//! Everything that changes the math lives here, including the IU/CU toggle,
//! so a head never reads ambient process state.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, ForecastResult};

/// Which uncertainty structure the heads produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadMode {
    /// Independent Laplace scales per agent (diagonal coupling).
    Individual,
    /// Laplace scales plus a cross-agent coupling per scene.
    #[default]
    Collaborative,
}

/// How the winner-takes-all mode is picked during training.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinnerCriterion {
    /// Sum of Euclidean errors over all valid future steps.
    #[default]
    AverageDisplacement,
    /// Euclidean error at the last valid future step.
    FinalDisplacement,
}

/// Mode-classification loss.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ClassificationLoss {
    /// Cross-entropy against the winner mode.
    CrossEntropy,
    /// Max-margin on the logits (LaneGCN style).
    ///
    /// Only agents whose best final error is below `threshold` take part, and
    /// only competing modes whose final error exceeds the best by more than
    /// `ignore` are pushed away.
    MaxMargin {
        margin: f64,
        threshold: f64,
        ignore: f64,
    },
}

impl Default for ClassificationLoss {
    fn default() -> Self {
        Self::CrossEntropy
    }
}

/// Configuration for the forecasting model and its loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastConfig {
    /// Width of the per-agent fused embedding coming from the scene encoder
    pub embed_dim: usize,
    /// Number of trajectory hypotheses (K)
    pub num_modes: usize,
    /// Number of future steps (T)
    pub horizon: usize,
    /// Residual blocks in each regression branch
    pub num_res_blocks: usize,
    /// IU or CU
    pub head_mode: HeadMode,
    /// Weight of the classification term (lambda_cls)
    pub cls_weight: f64,
    /// Weight of the regression NLL (lambda_reg)
    pub reg_weight: f64,
    /// Extra weight on the final future step
    #[serde(default)]
    pub final_step_weight: f64,
    /// Lower bound on every Laplace scale
    pub scale_floor: f64,
    /// One scale per future step (otherwise one per mode, shared over time)
    pub per_step_scale: bool,
    /// Rank of the per-agent coupling factor (R)
    pub coupling_rank: usize,
    /// Ridge added to the factor Gram matrix before normalization
    pub coupling_ridge: f64,
    /// Upper bound of the per-step coupling gate, must be < 1
    pub max_coupling: f64,
    /// Smoothing inside the square-root error transform of the cross term
    pub cross_smoothing: f64,
    /// Winner-takes-all criterion
    #[serde(default)]
    pub winner: WinnerCriterion,
    /// Classification loss
    #[serde(default)]
    pub classification: ClassificationLoss,
    /// Layer norm epsilon
    pub layer_norm_eps: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self::argoverse()
    }
}

impl ForecastConfig {
    /// Argoverse-style setup: 6 modes, 3 s at 10 Hz, 128-wide actor features.
    pub fn argoverse() -> Self {
        Self {
            embed_dim: 128,
            num_modes: 6,
            horizon: 30,
            num_res_blocks: 2,
            head_mode: HeadMode::Collaborative,
            cls_weight: 1.0,
            reg_weight: 1.0,
            final_step_weight: 0.0,
            scale_floor: 1e-3,
            per_step_scale: true,
            coupling_rank: 8,
            coupling_ridge: 0.05,
            max_coupling: 0.95,
            cross_smoothing: 1e-4,
            winner: WinnerCriterion::AverageDisplacement,
            classification: ClassificationLoss::CrossEntropy,
            layer_norm_eps: 1e-5,
        }
    }

    /// Same as [`ForecastConfig::argoverse`] with independent uncertainty only.
    pub fn individual() -> Self {
        Self::argoverse().with_head_mode(HeadMode::Individual)
    }

    /// Test configuration (minimal for unit tests)
    pub fn test() -> Self {
        Self {
            embed_dim: 16,
            num_modes: 2,
            horizon: 4,
            num_res_blocks: 1,
            head_mode: HeadMode::Collaborative,
            cls_weight: 1.0,
            reg_weight: 1.0,
            final_step_weight: 0.0,
            scale_floor: 1e-3,
            per_step_scale: true,
            coupling_rank: 3,
            coupling_ridge: 0.05,
            max_coupling: 0.95,
            cross_smoothing: 1e-4,
            winner: WinnerCriterion::AverageDisplacement,
            classification: ClassificationLoss::CrossEntropy,
            layer_norm_eps: 1e-5,
        }
    }

    /// Set the IU/CU mode.
    #[must_use]
    pub const fn with_head_mode(mut self, mode: HeadMode) -> Self {
        self.head_mode = mode;
        self
    }

    /// Set the number of modes.
    #[must_use]
    pub const fn with_num_modes(mut self, k: usize) -> Self {
        self.num_modes = k;
        self
    }

    /// Set the horizon length.
    #[must_use]
    pub const fn with_horizon(mut self, t: usize) -> Self {
        self.horizon = t;
        self
    }

    /// Set lambda_cls and lambda_reg.
    #[must_use]
    pub const fn with_loss_weights(mut self, cls: f64, reg: f64) -> Self {
        self.cls_weight = cls;
        self.reg_weight = reg;
        self
    }

    /// Set the scale floor.
    #[must_use]
    pub const fn with_scale_floor(mut self, eps: f64) -> Self {
        self.scale_floor = eps;
        self
    }

    /// Set the winner-takes-all criterion.
    #[must_use]
    pub const fn with_winner(mut self, winner: WinnerCriterion) -> Self {
        self.winner = winner;
        self
    }

    /// Set the classification loss.
    #[must_use]
    pub const fn with_classification(mut self, cls: ClassificationLoss) -> Self {
        self.classification = cls;
        self
    }

    /// Whether the collaborative head is built.
    pub fn is_collaborative(&self) -> bool {
        self.head_mode == HeadMode::Collaborative
    }

    /// Number of scale values emitted per (agent, mode): `T * 2` or `2`.
    pub fn scales_per_mode(&self) -> usize {
        if self.per_step_scale {
            self.horizon * 2
        } else {
            2
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ForecastError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> ForecastResult<()> {
        if self.embed_dim == 0 {
            return Err(ForecastError::invalid_config("embed_dim must be > 0"));
        }
        if self.num_modes == 0 {
            return Err(ForecastError::invalid_config("num_modes must be > 0"));
        }
        if self.horizon == 0 {
            return Err(ForecastError::invalid_config("horizon must be > 0"));
        }
        if !(self.scale_floor > 0.0 && self.scale_floor.is_finite()) {
            return Err(ForecastError::invalid_config(format!(
                "scale_floor must be a positive finite number, got {}",
                self.scale_floor
            )));
        }
        if self.cls_weight < 0.0 || self.reg_weight < 0.0 || self.final_step_weight < 0.0 {
            return Err(ForecastError::invalid_config("loss weights must be non-negative"));
        }
        if self.is_collaborative() {
            if self.coupling_rank == 0 {
                return Err(ForecastError::invalid_config("coupling_rank must be > 0"));
            }
            if !(self.coupling_ridge > 0.0) {
                return Err(ForecastError::invalid_config("coupling_ridge must be > 0"));
            }
            if !(self.max_coupling > 0.0 && self.max_coupling < 1.0) {
                return Err(ForecastError::invalid_config(format!(
                    "max_coupling must lie in (0, 1), got {}",
                    self.max_coupling
                )));
            }
            if !(self.cross_smoothing > 0.0) {
                return Err(ForecastError::invalid_config("cross_smoothing must be > 0"));
            }
        }
        if let ClassificationLoss::MaxMargin { margin, threshold, ignore } = self.classification {
            if margin <= 0.0 || threshold <= 0.0 || ignore < 0.0 {
                return Err(ForecastError::invalid_config(
                    "max-margin classification needs margin > 0, threshold > 0, ignore >= 0",
                ));
            }
        }
        Ok(())
    }

    /// Load a configuration from a JSON file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> ForecastResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> ForecastResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(ForecastConfig::argoverse().validate().is_ok());
        assert!(ForecastConfig::individual().validate().is_ok());
        assert!(ForecastConfig::test().validate().is_ok());
        assert_eq!(ForecastConfig::individual().head_mode, HeadMode::Individual);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ForecastConfig::test().with_num_modes(0).validate().is_err());
        assert!(ForecastConfig::test().with_scale_floor(0.0).validate().is_err());
        assert!(ForecastConfig::test().with_scale_floor(-1.0).validate().is_err());

        let mut config = ForecastConfig::test();
        config.max_coupling = 1.0;
        assert!(config.validate().is_err());

        // coupling knobs are ignored in IU mode
        config.head_mode = HeadMode::Individual;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scales_per_mode() {
        let mut config = ForecastConfig::test();
        assert_eq!(config.scales_per_mode(), config.horizon * 2);
        config.per_step_scale = false;
        assert_eq!(config.scales_per_mode(), 2);
    }

    #[test]
    fn test_json_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forecast.json");

        let config = ForecastConfig::test()
            .with_winner(WinnerCriterion::FinalDisplacement)
            .with_classification(ClassificationLoss::MaxMargin {
                margin: 0.2,
                threshold: 2.0,
                ignore: 0.2,
            });
        config.save(&path).unwrap();

        let loaded = ForecastConfig::from_file(&path).unwrap();
        assert_eq!(loaded.num_modes, config.num_modes);
        assert_eq!(loaded.winner, WinnerCriterion::FinalDisplacement);
        assert_eq!(loaded.classification, config.classification);
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        ForecastConfig::test().with_horizon(0).save(&path).unwrap();

        let err = ForecastConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ForecastError::InvalidConfig(_)));
    }
}

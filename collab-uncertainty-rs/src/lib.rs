//! Multi-agent trajectory forecasting with collaborative uncertainty
//!
//! This crate implements the prediction heads and the training objective
//! that sit on top of a scene encoder:
//! - K-mode trajectory regression with softmax mode confidences
//! - Individual uncertainty (IU): independent Laplace scales per agent
//! - Collaborative uncertainty (CU): a per-scene cross-agent coupling, kept
//!   positive definite with a unit diagonal by construction
//! - Winner-takes-all loss with cross-entropy or max-margin classification
//! - Calibrated confidence regions and uncertainty-weighted blending
//!
//! Scenes are batched densely as `(B, N, ...)` with a `(B, N)` agent mask.
//!
//! # Example
//!
//! ```no_run
//! use collab_uncertainty_rs::{ForecastConfig, ForecastModel, GroundTruth};
//! use candle_core::{DType, Device, Tensor};
//!
//! let config = ForecastConfig::argoverse();
//! let device = Device::Cpu;
//! let model = ForecastModel::new(&config, &device).unwrap();
//!
//! let embeddings = Tensor::randn(0.0f32, 1.0, (4, 12, config.embed_dim), &device).unwrap();
//! let mask = Tensor::ones((4, 12), DType::F32, &device).unwrap();
//! let future = Tensor::zeros((4, 12, config.horizon, 2), DType::F32, &device).unwrap();
//!
//! let output = model.forward(&embeddings, &mask).unwrap();
//! let loss = model.loss(&output, &GroundTruth::new(future), &mask).unwrap();
//! println!("loss = {}", loss.breakdown.total);
//! ```
//!
//! # Individual vs collaborative
//!
//! The uncertainty structure is fixed at construction through
//! [`ForecastConfig::head_mode`]. An IU model never builds the coupling head:
//!
//! ```no_run
//! use collab_uncertainty_rs::{ForecastConfig, ForecastModel};
//! use candle_core::Device;
//!
//! let model = ForecastModel::new(&ForecastConfig::individual(), &Device::Cpu).unwrap();
//! ```

pub mod batch;
pub mod calibration;
pub mod collaborative;
pub mod config;
pub mod error;
pub mod individual;
pub mod layers;
pub mod linalg;
pub mod loss;
pub mod model;
pub mod trainer;
pub mod trajectory;
pub mod transforms;

pub use batch::{GroundTruth, SceneBatch, SceneLayout};
pub use calibration::{ranked_modes, to_world, Calibration, CalibrationConfig, Calibrator, ConfidenceRegion};
pub use collaborative::{CollaborativeHead, CouplingParams, CouplingStructure};
pub use config::{ClassificationLoss, ForecastConfig, HeadMode, WinnerCriterion};
pub use error::{ForecastError, ForecastResult};
pub use individual::IndividualHead;
pub use loss::{LossAggregator, LossBreakdown, LossOutput};
pub use model::{ForecastModel, ForecastOutput, UncertaintyParams};
pub use trainer::{ForecastTrainer, StepMetrics, TrainerConfig};
pub use trajectory::{TrajectoryHead, WinnerSelection};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::batch::{GroundTruth, SceneBatch};
    pub use crate::calibration::{Calibration, Calibrator};
    pub use crate::config::{ForecastConfig, HeadMode};
    pub use crate::error::{ForecastError, ForecastResult};
    pub use crate::loss::{LossAggregator, LossOutput};
    pub use crate::model::{ForecastModel, ForecastOutput};
    pub use crate::trainer::{ForecastTrainer, TrainerConfig};
}

//! Padded scene batches.
//!
//! Scenes hold different numbers of agents. Every tensor is laid out densely
//! as `(B, N, ...)` with `N` the largest scene in the batch, and an explicit
//! `(B, N)` validity mask. Nothing downstream inspects per-scene counts.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};

use crate::error::{expect_dims, ForecastError, ForecastResult};

/// Observed future trajectories.
#[derive(Debug, Clone)]
pub struct GroundTruth {
    /// `(B, N, T, 2)` future positions in the scene frame
    pub future: Tensor,
    /// `(B, N, T)` 1.0 where the future step was observed; `None` = all observed
    pub step_mask: Option<Tensor>,
}

impl GroundTruth {
    /// Fully observed futures.
    pub fn new(future: Tensor) -> Self {
        Self {
            future,
            step_mask: None,
        }
    }

    /// Futures with a per-step observation mask.
    pub fn with_step_mask(future: Tensor, step_mask: Tensor) -> Self {
        Self {
            future,
            step_mask: Some(step_mask),
        }
    }

    /// `(B, N, T)` mask of supervised steps: observed and belonging to a valid agent.
    pub fn valid_steps(&self, agent_mask: &Tensor) -> ForecastResult<Tensor> {
        let (b, n, t, _) = self.future.dims4()?;
        expect_dims("ground truth", &self.future, &[b, n, t, 2])?;
        expect_dims("agent mask", agent_mask, &[b, n])?;

        let agent = agent_mask.to_dtype(DType::F32)?.unsqueeze(2)?;
        let steps = match &self.step_mask {
            Some(mask) => {
                expect_dims("step mask", mask, &[b, n, t])?;
                mask.to_dtype(DType::F32)?.broadcast_mul(&agent)?
            }
            None => agent.broadcast_as((b, n, t))?.contiguous()?,
        };
        Ok(steps)
    }

    /// The future with every cell outside `valid_steps` replaced by zero.
    ///
    /// Padding and unobserved steps may hold anything, NaN included, and
    /// masking by multiplication would carry it into the sums (`NaN * 0`).
    pub fn supervised_future(&self, valid_steps: &Tensor) -> ForecastResult<Tensor> {
        let keep = valid_steps
            .gt(0.0)?
            .unsqueeze(3)?
            .broadcast_as(self.future.shape())?
            .contiguous()?;
        Ok(keep.where_cond(&self.future, &self.future.zeros_like()?)?)
    }
}

/// Where each agent of a ragged input landed in the padded layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneLayout {
    /// Distinct scene ids in ascending order; index = batch row
    pub scene_ids: Vec<usize>,
    /// `(batch row, slot)` of every input agent, in input order
    pub slots: Vec<(usize, usize)>,
    /// Padded agent count `N`
    pub max_agents: usize,
}

impl SceneLayout {
    /// Group agents by scene id. Agents keep their relative order within a scene.
    pub fn from_scene_ids(scene_ids: &[usize]) -> ForecastResult<Self> {
        if scene_ids.is_empty() {
            return Err(ForecastError::batch("cannot pack an empty agent list"));
        }
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for id in scene_ids {
            *counts.entry(*id).or_default() += 1;
        }
        let rows: BTreeMap<usize, usize> = counts.keys().enumerate().map(|(r, id)| (*id, r)).collect();
        let max_agents = counts.values().copied().max().unwrap_or(0);

        let mut next_slot = vec![0usize; rows.len()];
        let slots = scene_ids
            .iter()
            .map(|id| {
                let row = rows[id];
                let slot = next_slot[row];
                next_slot[row] += 1;
                (row, slot)
            })
            .collect();

        Ok(Self {
            scene_ids: counts.into_keys().collect(),
            slots,
            max_agents,
        })
    }

    /// Number of scenes `B`.
    pub fn num_scenes(&self) -> usize {
        self.scene_ids.len()
    }

    /// Number of ragged agents.
    pub fn num_agents(&self) -> usize {
        self.slots.len()
    }

    /// Flat padded index `row * N + slot` of every input agent.
    fn flat_positions(&self) -> Vec<u32> {
        self.slots
            .iter()
            .map(|(row, slot)| (row * self.max_agents + slot) as u32)
            .collect()
    }

    /// Scatter `(A, ...)` per-agent rows into a zero-padded `(B, N, ...)` tensor.
    pub fn pad(&self, ragged: &Tensor) -> ForecastResult<Tensor> {
        let dims = ragged.dims().to_vec();
        if dims.first() != Some(&self.num_agents()) {
            return Err(ForecastError::shape_mismatch(
                format!("leading dim {}", self.num_agents()),
                format!("{dims:?}"),
            ));
        }
        let total = self.num_scenes() * self.max_agents;
        // Source row for every padded cell; empty cells read the appended zero row.
        let mut source = vec![self.num_agents() as u32; total];
        for (agent, pos) in self.flat_positions().into_iter().enumerate() {
            source[pos as usize] = agent as u32;
        }
        let source = Tensor::from_vec(source, total, ragged.device())?;

        let mut zero_dims = dims.clone();
        zero_dims[0] = 1;
        let zero = Tensor::zeros(zero_dims, ragged.dtype(), ragged.device())?;
        let extended = Tensor::cat(&[ragged, &zero], 0)?;

        let mut out_dims = vec![self.num_scenes(), self.max_agents];
        out_dims.extend_from_slice(&dims[1..]);
        Ok(extended.index_select(&source, 0)?.reshape(out_dims)?)
    }

    /// Gather `(B, N, ...)` padded rows back into `(A, ...)` input order.
    pub fn unpack(&self, padded: &Tensor) -> ForecastResult<Tensor> {
        let dims = padded.dims().to_vec();
        if dims.len() < 2 || dims[0] != self.num_scenes() || dims[1] != self.max_agents {
            return Err(ForecastError::shape_mismatch(
                format!("({}, {}, ...)", self.num_scenes(), self.max_agents),
                format!("{dims:?}"),
            ));
        }
        let mut flat_dims = vec![dims[0] * dims[1]];
        flat_dims.extend_from_slice(&dims[2..]);
        let positions = Tensor::from_vec(self.flat_positions(), self.num_agents(), padded.device())?;
        Ok(padded.reshape(flat_dims)?.index_select(&positions, 0)?)
    }
}

/// One forward/loss batch of scenes in padded layout.
#[derive(Debug, Clone)]
pub struct SceneBatch {
    /// `(B, N, D)` fused per-agent embeddings
    pub embeddings: Tensor,
    /// `(B, N)` 1.0 for real agents, 0.0 for padding
    pub agent_mask: Tensor,
    /// Futures, present for training batches
    pub ground_truth: Option<GroundTruth>,
    /// Ragged-to-padded mapping when the batch was packed
    pub layout: Option<SceneLayout>,
}

impl SceneBatch {
    /// Wrap already padded tensors.
    pub fn padded(embeddings: Tensor, agent_mask: Tensor, ground_truth: Option<GroundTruth>) -> ForecastResult<Self> {
        let (b, n, _) = embeddings.dims3()?;
        expect_dims("agent mask", &agent_mask, &[b, n])?;
        if let Some(gt) = &ground_truth {
            let (gb, gn, _, _) = gt.future.dims4()?;
            if (gb, gn) != (b, n) {
                return Err(ForecastError::shape_mismatch(
                    format!("ground truth ({b}, {n}, T, 2)"),
                    format!("{:?}", gt.future.dims()),
                ));
            }
        }
        Ok(Self {
            embeddings,
            agent_mask: agent_mask.to_dtype(DType::F32)?,
            ground_truth,
            layout: None,
        })
    }

    /// Pack a ragged agent list into the padded layout.
    ///
    /// * `embeddings` - `(A, D)` one row per agent
    /// * `scene_ids` - scene of each agent
    /// * `valid` - optional per-agent validity (defaults to all valid)
    /// * `futures` - optional `(A, T, 2)` ground truth
    /// * `step_mask` - optional `(A, T)` observation mask for the futures
    pub fn pack(
        embeddings: &Tensor,
        scene_ids: &[usize],
        valid: Option<&[bool]>,
        futures: Option<&Tensor>,
        step_mask: Option<&Tensor>,
    ) -> ForecastResult<Self> {
        let (agents, _) = embeddings.dims2()?;
        if scene_ids.len() != agents {
            return Err(ForecastError::shape_mismatch(
                format!("{agents} scene ids"),
                format!("{}", scene_ids.len()),
            ));
        }
        let layout = SceneLayout::from_scene_ids(scene_ids)?;
        let device = embeddings.device();

        let flags: Vec<f32> = match valid {
            Some(v) if v.len() != agents => {
                return Err(ForecastError::batch(format!(
                    "got {} validity flags for {agents} agents",
                    v.len()
                )))
            }
            Some(v) => v.iter().map(|&ok| if ok { 1.0 } else { 0.0 }).collect(),
            None => vec![1.0; agents],
        };
        let agent_mask = layout.pad(&Tensor::from_vec(flags, agents, device)?)?;

        let ground_truth = match futures {
            Some(future) => {
                let future = layout.pad(future)?;
                match step_mask {
                    Some(mask) => Some(GroundTruth::with_step_mask(future, layout.pad(mask)?)),
                    None => Some(GroundTruth::new(future)),
                }
            }
            None if step_mask.is_some() => {
                return Err(ForecastError::batch("step mask given without futures"));
            }
            None => None,
        };

        Ok(Self {
            embeddings: layout.pad(embeddings)?,
            agent_mask,
            ground_truth,
            layout: Some(layout),
        })
    }

    /// Number of scenes.
    pub fn num_scenes(&self) -> usize {
        self.embeddings.dims()[0]
    }

    /// Padded agents per scene.
    pub fn max_agents(&self) -> usize {
        self.embeddings.dims()[1]
    }

    pub fn device(&self) -> &Device {
        self.embeddings.device()
    }

    /// Map padded `(B, N, ...)` outputs back to the input agent order, if packed.
    pub fn unpack(&self, padded: &Tensor) -> ForecastResult<Tensor> {
        match &self.layout {
            Some(layout) => layout.unpack(padded),
            None => Ok(padded.clone()),
        }
    }
}

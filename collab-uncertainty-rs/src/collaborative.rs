//! Collaborative uncertainty: a per-scene coupling between agents.
//!
//! The head emits, per agent and mode, a rank-`R` coupling factor and a gate
//! logit per future step. [`CouplingStructure::build`] turns those into a
//! unit-diagonal precision over the padded agents of a scene at every step,
//!
//! ```text
//! P_t = diag(Λ_t) + γ_t H_t H_tᵀ,   Λ_ti = 1 - γ_t ‖h_ti‖²
//! ```
//!
//! where `h` is the row-normalized factor (`‖h‖ < 1`), `H_t` zeroes the rows
//! of padded agents and unobserved steps, and `γ_t ∈ [0, max_coupling)` is the
//! gate averaged over the agents observed at step `t`. `P_t` is positive
//! definite for any raw input, and a padded row contributes exactly nothing:
//! its diagonal is 1 and its off-diagonal entries are 0.
//!
//! Nothing here materializes an `N x N` matrix except [`CouplingStructure::dense`].
//! Determinants and marginal variances go through the `R x R` capacitance
//! matrix `M_t = I + γ_t H_tᵀ Λ_t⁻¹ H_t`.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Linear, VarBuilder};

use crate::config::ForecastConfig;
use crate::error::{expect_dims, ForecastResult};
use crate::layers::{linear_nd, ResidualBlock};
use crate::linalg::{cholesky, solve_lower, Cholesky};
use crate::trajectory::select_mode;
use crate::transforms::{bounded_gate, ensure_finite};

/// Raw coupling outputs for every mode.
#[derive(Debug, Clone)]
pub struct CouplingParams {
    /// `(B, N, K, R)` unnormalized coupling factors
    pub factors: Tensor,
    /// `(B, N, K, T)` per-step gates in `[0, max_coupling)`
    pub gates: Tensor,
}

impl CouplingParams {
    /// Reduce the mode axis with a `(B, N, K)` one-hot.
    ///
    /// Returns `(factors (B, N, R), gates (B, N, T))`.
    pub fn select(&self, one_hot: &Tensor) -> Result<(Tensor, Tensor)> {
        Ok((select_mode(&self.factors, one_hot)?, select_mode(&self.gates, one_hot)?))
    }

    /// Fold modes into the scene axis so every mode gets its own coupling.
    ///
    /// Returns `(factors (B*K, N, R), gates (B*K, N, T))`, scene-major.
    pub fn fold_modes(&self) -> Result<(Tensor, Tensor)> {
        Ok((fold(&self.factors)?, fold(&self.gates)?))
    }
}

/// `(B, N, K, X)` -> `(B*K, N, X)`
fn fold(x: &Tensor) -> Result<Tensor> {
    let (b, n, k, c) = x.dims4()?;
    x.permute((0, 2, 1, 3))?.contiguous()?.reshape((b * k, n, c))
}

/// Head producing coupling factors and gates from the mode features.
pub struct CollaborativeHead {
    block: ResidualBlock,
    factor: Linear,
    gate: Linear,
    max_coupling: f64,
}

impl CollaborativeHead {
    pub fn new(config: &ForecastConfig, vb: VarBuilder) -> ForecastResult<Self> {
        config.validate()?;
        let d = config.embed_dim;
        Ok(Self {
            block: ResidualBlock::new(d, config.layer_norm_eps, vb.pp("res"))?,
            factor: candle_nn::linear(d, config.coupling_rank, vb.pp("factor"))?,
            gate: candle_nn::linear(d, config.horizon, vb.pp("gate"))?,
            max_coupling: config.max_coupling,
        })
    }

    /// Input: (B, N, K, D)
    pub fn forward(&self, mode_features: &Tensor) -> ForecastResult<CouplingParams> {
        let h = self.block.forward(mode_features)?;
        let factors = linear_nd(&self.factor, &h)?;
        ensure_finite("coupling_factors", &factors)?;
        let gates = bounded_gate(&linear_nd(&self.gate, &h)?, self.max_coupling)?;
        Ok(CouplingParams { factors, gates })
    }
}

/// Coupling of one scene batch, laid out time-major: `(S, T, N, ...)`.
#[derive(Debug, Clone)]
pub struct CouplingStructure {
    /// `(S, T, N, R)` normalized factors, zero on invalid (agent, step) pairs
    pub factors: Tensor,
    /// `(S, T)` scene-level gate per step
    pub gamma: Tensor,
    /// `(S, T, N)` diagonal `Λ`
    pub lambda: Tensor,
    /// `(S, T, N)` squared factor norms `‖h_ti‖²`
    pub factor_norms: Tensor,
    capacitance: Cholesky,
}

impl CouplingStructure {
    /// Build the coupling from raw factors and gates.
    ///
    /// * `factors` - `(S, N, R)` raw factors
    /// * `gates` - `(S, N, T)` per-agent gates
    /// * `valid_steps` - `(S, N, T)` 1.0 where the agent is observed at that step
    /// * `ridge` - ridge `ρ` of the row normalization
    pub fn build(factors: &Tensor, gates: &Tensor, valid_steps: &Tensor, ridge: f64) -> ForecastResult<Self> {
        let (s, n, r) = factors.dims3()?;
        let (_, _, t) = valid_steps.dims3()?;
        expect_dims("coupling gates", gates, &[s, n, t])?;
        expect_dims("coupling step mask", valid_steps, &[s, n, t])?;
        let valid = valid_steps.to_dtype(DType::F32)?;

        let h = normalize_rows(factors, ridge)?;

        // γ_t: mean gate over agents observed at t
        let observed = valid.sum(1)?;
        let gamma = (gates.mul(&valid)?.sum(1)? / observed.maximum(1.0)?)?;

        // (S, T, N, R) with invalid rows zeroed
        let step_mask = valid.transpose(1, 2)?.unsqueeze(3)?;
        let factors = h
            .unsqueeze(1)?
            .broadcast_mul(&step_mask)?
            .contiguous()?;
        let factor_norms = factors.sqr()?.sum(3)?;
        let lambda = gamma
            .unsqueeze(2)?
            .broadcast_mul(&factor_norms)?
            .affine(-1.0, 1.0)?;

        // M = I + γ Hᵀ Λ⁻¹ H
        let scaled = factors.broadcast_div(&lambda.unsqueeze(3)?)?;
        let gram = factors.transpose(2, 3)?.contiguous()?.matmul(&scaled)?;
        let eye = Tensor::eye(r, DType::F32, factors.device())?;
        let capacitance = gram
            .broadcast_mul(&gamma.unsqueeze(2)?.unsqueeze(3)?)?
            .broadcast_add(&eye)?;
        let capacitance = cholesky(&capacitance)?;

        tracing::trace!(scenes = s, agents = n, rank = r, steps = t, "built coupling");

        Ok(Self {
            factors,
            gamma,
            lambda,
            factor_norms,
            capacitance,
        })
    }

    /// Dense symmetrized precision `(S, T, N, N)`.
    pub fn dense(&self) -> Result<Tensor> {
        let (_, _, n, _) = self.factors.dims4()?;
        let eye = Tensor::eye(n, DType::F32, self.factors.device())?;
        let diag = self.lambda.unsqueeze(3)?.broadcast_mul(&eye)?;
        let outer = self
            .factors
            .matmul(&self.factors.transpose(2, 3)?.contiguous()?)?
            .broadcast_mul(&self.gamma.unsqueeze(2)?.unsqueeze(3)?)?;
        let p = (diag + outer)?;
        (&p + p.transpose(2, 3)?)? * 0.5
    }

    /// `log det P_t` per scene and step, `(S, T)`.
    ///
    /// Matrix determinant lemma: `Σ_i log Λ_ti + log det M_t`.
    pub fn log_det(&self) -> ForecastResult<Tensor> {
        let diag = self.lambda.log()?.sum(D::Minus1)?;
        Ok((diag + self.capacitance.log_det()?)?)
    }

    /// Off-diagonal quadratic form `Σ_{i≠j} P_ij u_i u_j` for each axis.
    ///
    /// `u` is `(S, T, N, A)`; returns `(S, T, A)`.
    pub fn cross_term(&self, u: &Tensor) -> Result<Tensor> {
        let projected = self.factors.transpose(2, 3)?.contiguous()?.matmul(u)?;
        let full = projected.sqr()?.sum(2)?;
        let self_terms = u.sqr()?.broadcast_mul(&self.factor_norms.unsqueeze(3)?)?.sum(2)?;
        (full - self_terms)?.broadcast_mul(&self.gamma.unsqueeze(2)?)
    }

    /// `sqrt(max((P_t⁻¹)_ii, 1))` per scene, step and agent, `(S, T, N)`.
    ///
    /// Woodbury: `(P⁻¹)_ii = 1/Λ_i - γ ‖L⁻¹ g_i‖²` with `g_i = h_i / Λ_i`
    /// and `M = L Lᵀ`. A unit-diagonal precision always gives a value >= 1;
    /// the clamp only absorbs rounding.
    pub fn marginal_inflation(&self) -> ForecastResult<Tensor> {
        let g = self.factors.broadcast_div(&self.lambda.unsqueeze(3)?)?;
        let solved = solve_lower(&self.capacitance.factor, &g.transpose(2, 3)?.contiguous()?)?;
        let correction = solved.sqr()?.sum(2)?.broadcast_mul(&self.gamma.unsqueeze(2)?)?;
        let inv_diag = (self.lambda.recip()? - correction)?;
        Ok(inv_diag.maximum(1.0)?.sqrt()?)
    }
}

/// Overflow-safe row normalization, `‖h‖² < 1` for every row.
///
/// `c = max(max|f|, 1)`, `f̂ = f/c`, `h = f̂ / sqrt(‖f̂‖² + ρ/c²)`.
pub fn normalize_rows(factors: &Tensor, ridge: f64) -> Result<Tensor> {
    let c = factors.abs()?.max_keepdim(D::Minus1)?.maximum(1.0)?;
    let f = factors.broadcast_div(&c)?;
    let ridge = (c.sqr()?.recip()? * ridge)?;
    let norm = (f.sqr()?.sum_keepdim(D::Minus1)? + ridge)?.sqrt()?;
    f.broadcast_div(&norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn approx(a: f32, b: f32, tol: f32) -> bool {
        (a - b).abs() <= tol * (1.0 + b.abs())
    }

    #[test]
    fn test_normalized_rows_inside_unit_ball() {
        let device = Device::Cpu;
        let f = Tensor::new(
            &[[0.0f32, 0.0, 0.0], [1e30, -1e30, 5.0], [1e-20, 0.0, 0.0], [3.0, 4.0, 0.0]],
            &device,
        )
        .unwrap();
        let h = normalize_rows(&f, 0.05).unwrap();
        let norms: Vec<f32> = h.sqr().unwrap().sum(1).unwrap().to_vec1().unwrap();
        for v in &norms {
            // the ridge underflows for huge rows, leaving a unit vector up to rounding
            assert!(v.is_finite() && *v < 1.0 + 1e-6, "norm² {v}");
        }
        // 25 / (25 + 0.05/16), after dividing by c = 4
        assert!(approx(norms[3], 25.0 / 16.0 / (25.0 / 16.0 + 0.05 / 16.0), 1e-5));
    }

    #[test]
    fn test_dense_symmetric_unit_diagonal_extreme_inputs() {
        let device = Device::Cpu;
        let factors = (Tensor::randn(0.0f32, 1.0, (2, 4, 3), &device).unwrap() * 1e20).unwrap();
        let gates = Tensor::full(0.95f32, (2, 4, 5), &device).unwrap();
        let valid = Tensor::ones((2, 4, 5), DType::F32, &device).unwrap();

        let c = CouplingStructure::build(&factors, &gates, &valid, 0.05).unwrap();
        let p = c.dense().unwrap();
        assert_eq!(p.dims(), &[2, 5, 4, 4]);

        let asym = (&p - p.transpose(2, 3).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_keepdim(3)
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(asym, 0.0);

        let eye = Tensor::eye(4, DType::F32, &device).unwrap();
        let diag: Vec<f32> = p.broadcast_mul(&eye).unwrap().sum(3).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for d in diag {
            assert!((d - 1.0).abs() < 1e-5, "diag {d}");
        }

        // positive definite: dense factorization succeeds
        assert!(cholesky(&p).is_ok());
    }

    #[test]
    fn test_log_det_matches_dense() {
        let device = Device::Cpu;
        let factors = Tensor::randn(0.0f32, 1.0, (1, 3, 2), &device).unwrap();
        let gates = Tensor::full(0.8f32, (1, 3, 2), &device).unwrap();
        let valid = Tensor::ones((1, 3, 2), DType::F32, &device).unwrap();

        let c = CouplingStructure::build(&factors, &gates, &valid, 0.05).unwrap();
        let lemma: Vec<Vec<f32>> = c.log_det().unwrap().to_vec2().unwrap();
        let dense: Vec<Vec<f32>> = cholesky(&c.dense().unwrap()).unwrap().log_det().unwrap().to_vec2().unwrap();
        for (a, b) in lemma.iter().flatten().zip(dense.iter().flatten()) {
            assert!(approx(*a, *b, 1e-4), "{a} vs {b}");
            // unit diagonal => det <= 1
            assert!(*a <= 1e-5);
        }
    }

    #[test]
    fn test_single_agent_is_uncoupled() {
        let device = Device::Cpu;
        let factors = Tensor::new(&[[[2.0f32, -1.0]]], &device).unwrap();
        let gates = Tensor::full(0.9f32, (1, 1, 3), &device).unwrap();
        let valid = Tensor::ones((1, 1, 3), DType::F32, &device).unwrap();
        let c = CouplingStructure::build(&factors, &gates, &valid, 0.05).unwrap();

        let log_det: Vec<f32> = c.log_det().unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(log_det.iter().all(|v| v.abs() < 1e-5));

        let u = Tensor::ones((1, 3, 1, 2), DType::F32, &device).unwrap();
        let cross: Vec<f32> = c.cross_term(&u).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(cross.iter().all(|v| v.abs() < 1e-5));
    }

    #[test]
    fn test_masked_agents_do_not_change_log_det() {
        let device = Device::Cpu;
        let factors = Tensor::randn(0.0f32, 1.0, (1, 2, 3), &device).unwrap();
        let gates = Tensor::randn(0.0f32, 1.0, (1, 2, 4), &device).unwrap();
        let gates = bounded_gate(&gates, 0.95).unwrap();
        let valid = Tensor::ones((1, 2, 4), DType::F32, &device).unwrap();
        let base = CouplingStructure::build(&factors, &gates, &valid, 0.05)
            .unwrap()
            .log_det()
            .unwrap();

        // two padding agents with large factors and gates
        let pad_f = (Tensor::ones((1, 2, 3), DType::F32, &device).unwrap() * 50.0).unwrap();
        let pad_g = Tensor::full(0.94f32, (1, 2, 4), &device).unwrap();
        let factors = Tensor::cat(&[&factors, &pad_f], 1).unwrap();
        let gates = Tensor::cat(&[&gates, &pad_g], 1).unwrap();
        let valid = Tensor::cat(&[&valid, &Tensor::zeros((1, 2, 4), DType::F32, &device).unwrap()], 1).unwrap();
        let padded = CouplingStructure::build(&factors, &gates, &valid, 0.05)
            .unwrap()
            .log_det()
            .unwrap();

        let a: Vec<f32> = base.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = padded.flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!(approx(*x, *y, 1e-5), "{x} vs {y}");
        }
    }

    #[test]
    fn test_zero_gate_is_identity() {
        let device = Device::Cpu;
        let factors = Tensor::randn(0.0f32, 1.0, (1, 3, 2), &device).unwrap();
        let gates = Tensor::zeros((1, 3, 2), DType::F32, &device).unwrap();
        let valid = Tensor::ones((1, 3, 2), DType::F32, &device).unwrap();
        let c = CouplingStructure::build(&factors, &gates, &valid, 0.05).unwrap();

        let log_det = c.log_det().unwrap().abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(log_det < 1e-6);
        let infl: Vec<f32> = c.marginal_inflation().unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(infl.iter().all(|v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_marginal_inflation_matches_dense_inverse() {
        let device = Device::Cpu;
        // two strongly aligned agents
        let factors = Tensor::new(&[[[1.0f32, 0.0], [1.0, 0.1]]], &device).unwrap();
        let gates = Tensor::full(0.9f32, (1, 2, 1), &device).unwrap();
        let valid = Tensor::ones((1, 2, 1), DType::F32, &device).unwrap();
        let c = CouplingStructure::build(&factors, &gates, &valid, 0.05).unwrap();

        let p: Vec<Vec<f32>> = c.dense().unwrap().squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        let det = p[0][0] * p[1][1] - p[0][1] * p[1][0];
        let inv_diag = [p[1][1] / det, p[0][0] / det];

        let infl: Vec<f32> = c.marginal_inflation().unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (got, want) in infl.iter().zip(inv_diag) {
            assert!(approx(*got, want.max(1.0).sqrt(), 1e-4), "{got} vs {}", want.sqrt());
            assert!(*got > 1.0);
        }
    }

    #[test]
    fn test_head_and_fold_shapes() {
        let config = ForecastConfig::test();
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let head = CollaborativeHead::new(&config, vb).unwrap();

        let k = config.num_modes;
        let feats = Tensor::randn(0.0f32, 1.0, (2, 3, k, config.embed_dim), &device).unwrap();
        let params = head.forward(&feats).unwrap();
        assert_eq!(params.factors.dims(), &[2, 3, k, config.coupling_rank]);
        assert_eq!(params.gates.dims(), &[2, 3, k, config.horizon]);

        let (f, g) = params.fold_modes().unwrap();
        assert_eq!(f.dims(), &[2 * k, 3, config.coupling_rank]);
        assert_eq!(g.dims(), &[2 * k, 3, config.horizon]);

        // row 1 of the fold is scene 0, mode 1
        let direct: Vec<f32> = params.factors.get(0).unwrap().narrow(1, 1, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let folded: Vec<f32> = f.get(1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(direct, folded);
    }

    #[test]
    fn test_non_finite_factors_are_reported() {
        let config = ForecastConfig::test();
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let head = CollaborativeHead::new(&config, vb).unwrap();

        let feats = Tensor::full(f32::NAN, (1, 2, config.num_modes, config.embed_dim), &device).unwrap();
        match head.forward(&feats) {
            Err(crate::error::ForecastError::NumericalInstability { stage, .. }) => {
                assert_eq!(stage, "coupling_factors")
            }
            other => panic!("expected coupling_factors instability, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_head_rejects_invalid_coupling_config() {
        let mut config = ForecastConfig::test();
        config.max_coupling = 1.0;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(CollaborativeHead::new(&config, vb).is_err());
    }
}

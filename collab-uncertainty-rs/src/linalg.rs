//! Small batched dense linear algebra on candle tensors.
//!
//! The coupling only ever needs factorizations of `R x R` matrices, where `R`
//! is the coupling rank, so the loops below run over `R` while every step is
//! vectorized over all leading (scene, time, ...) dimensions. All ops are
//! plain tensor ops, so gradients flow through them.

use candle_core::{Tensor, D};

use crate::error::{ForecastError, ForecastResult};
use crate::transforms::ensure_finite;

/// Lower Cholesky factor of a batch of symmetric positive-definite matrices.
#[derive(Debug, Clone)]
pub struct Cholesky {
    /// `L` with `A = L Lᵀ`, shape `(..., n, n)`
    pub factor: Tensor,
    /// Diagonal of `L`, shape `(..., n)`
    pub diagonal: Tensor,
}

impl Cholesky {
    /// `log det A = 2 Σ log L_jj`, shape `(...)`.
    pub fn log_det(&self) -> ForecastResult<Tensor> {
        Ok((self.diagonal.log()?.sum(D::Minus1)? * 2.0)?)
    }
}

fn square_size(what: &str, a: &Tensor) -> ForecastResult<usize> {
    let rank = a.rank();
    if rank < 2 || a.dim(rank - 1)? != a.dim(rank - 2)? {
        return Err(ForecastError::shape_mismatch(
            format!("{what} with trailing square dims (..., n, n)"),
            format!("{:?}", a.dims()),
        ));
    }
    Ok(a.dim(rank - 1)?)
}

/// Column-by-column Cholesky–Banachiewicz factorization over `(..., n, n)`.
///
/// # Errors
///
/// [`ForecastError::NumericalInstability`] when a pivot is not positive.
pub fn cholesky(a: &Tensor) -> ForecastResult<Cholesky> {
    let n = square_size("cholesky input", a)?;
    let rank = a.rank();
    let (row_dim, col_dim) = (rank - 2, rank - 1);

    let mut columns: Vec<Tensor> = Vec::with_capacity(n);
    let mut pivots: Vec<Tensor> = Vec::with_capacity(n);

    for j in 0..n {
        // Column j of A; A is symmetric so this is also row j.
        let a_col = a.narrow(col_dim, j, 1)?.squeeze(col_dim)?;

        let residual = if j == 0 {
            a_col
        } else {
            // Σ_{k<j} L_ik L_jk for every row i at once
            let done = Tensor::stack(&columns, col_dim)?;
            let row_j = done.narrow(row_dim, j, 1)?.transpose(row_dim, col_dim)?.contiguous()?;
            let dots = done.matmul(&row_j)?.squeeze(col_dim)?;
            (a_col - dots)?
        };

        let pivot = residual.narrow(row_dim, j, 1)?.sqrt()?;
        let keep: Vec<f32> = (0..n).map(|i| if i >= j { 1.0 } else { 0.0 }).collect();
        let keep = Tensor::from_vec(keep, n, a.device())?.to_dtype(a.dtype())?;

        columns.push(residual.broadcast_div(&pivot)?.broadcast_mul(&keep)?);
        pivots.push(pivot);
    }

    let factor = Tensor::stack(&columns, col_dim)?;
    let diagonal = Tensor::cat(&pivots, row_dim)?;
    ensure_finite("cholesky", &diagonal)?;
    Ok(Cholesky { factor, diagonal })
}

/// Solve `L X = B` by forward substitution.
///
/// `l` is `(..., n, n)` lower triangular, `b` is `(..., n, c)`.
pub fn solve_lower(l: &Tensor, b: &Tensor) -> ForecastResult<Tensor> {
    let n = square_size("triangular factor", l)?;
    let rank = l.rank();
    if b.rank() != rank || b.dim(rank - 2)? != n {
        return Err(ForecastError::shape_mismatch(
            format!("right-hand side (..., {n}, c)"),
            format!("{:?}", b.dims()),
        ));
    }
    let (row_dim, col_dim) = (rank - 2, rank - 1);

    let mut rows: Vec<Tensor> = Vec::with_capacity(n);
    for j in 0..n {
        let l_row = l.narrow(row_dim, j, 1)?;
        let b_row = b.narrow(row_dim, j, 1)?;
        let rhs = if j == 0 {
            b_row
        } else {
            let solved = Tensor::cat(&rows, row_dim)?;
            let coeffs = l_row.narrow(col_dim, 0, j)?.contiguous()?;
            (b_row - coeffs.matmul(&solved)?)?
        };
        let l_jj = l_row.narrow(col_dim, j, 1)?;
        rows.push(rhs.broadcast_div(&l_jj)?);
    }
    Ok(Tensor::cat(&rows, row_dim)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn spd_3x3(device: &Device) -> Tensor {
        // A = L Lᵀ with L = [[2,0,0],[1,3,0],[-1,0.5,1]]
        Tensor::new(
            &[[4.0f32, 2.0, -2.0], [2.0, 10.0, 0.5], [-2.0, 0.5, 2.25]],
            device,
        )
        .unwrap()
    }

    #[test]
    fn test_cholesky_recovers_factor() {
        let device = Device::Cpu;
        let chol = cholesky(&spd_3x3(&device)).unwrap();
        let l: Vec<Vec<f32>> = chol.factor.to_vec2().unwrap();
        let expected = [[2.0f32, 0.0, 0.0], [1.0, 3.0, 0.0], [-1.0, 0.5, 1.0]];
        for i in 0..3 {
            for j in 0..3 {
                assert!((l[i][j] - expected[i][j]).abs() < 1e-5, "L[{i}][{j}] = {}", l[i][j]);
            }
        }
    }

    #[test]
    fn test_log_det() {
        let device = Device::Cpu;
        let chol = cholesky(&spd_3x3(&device)).unwrap();
        let log_det = chol.log_det().unwrap().to_scalar::<f32>().unwrap();
        // det = (2*3*1)^2 = 36
        assert!((log_det - 36f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_batched_identity() {
        let device = Device::Cpu;
        let eye = Tensor::eye(4, candle_core::DType::F32, &device).unwrap();
        let batch = eye.unsqueeze(0).unwrap().unsqueeze(0).unwrap()
            .broadcast_as((2, 3, 4, 4)).unwrap().contiguous().unwrap();
        let chol = cholesky(&batch).unwrap();
        assert_eq!(chol.factor.dims(), &[2, 3, 4, 4]);
        let log_det: Vec<Vec<f32>> = chol.log_det().unwrap().to_vec2().unwrap();
        assert!(log_det.iter().flatten().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn test_cholesky_rejects_indefinite() {
        let device = Device::Cpu;
        let a = Tensor::new(&[[1.0f32, 2.0], [2.0, 1.0]], &device).unwrap();
        assert!(matches!(
            cholesky(&a).unwrap_err(),
            ForecastError::NumericalInstability { .. }
        ));
    }

    #[test]
    fn test_cholesky_rejects_non_square() {
        let device = Device::Cpu;
        let a = Tensor::zeros((2, 3), candle_core::DType::F32, &device).unwrap();
        assert!(matches!(cholesky(&a).unwrap_err(), ForecastError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_solve_lower() {
        let device = Device::Cpu;
        let chol = cholesky(&spd_3x3(&device)).unwrap();
        let b = Tensor::new(&[[1.0f32, 0.0], [2.0, 1.0], [3.0, -1.0]], &device).unwrap();
        let x = solve_lower(&chol.factor, &b).unwrap();
        let back: Vec<Vec<f32>> = chol.factor.matmul(&x).unwrap().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = b.to_vec2().unwrap();
        for i in 0..3 {
            for j in 0..2 {
                assert!((back[i][j] - b[i][j]).abs() < 1e-5);
            }
        }
    }
}

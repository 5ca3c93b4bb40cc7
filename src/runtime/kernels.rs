//! runtime/kernels.rs — the numeric kernels a CHOL/TRSM/SYRK/GEMM
//! instruction calls out to (spec §4.9, §6). These are deliberately plain,
//! unoptimized dense routines: the runtime's job is scheduling correctness
//! and throughput, not BLAS performance, so `DenseKernels` exists to make
//! the scheduler's behavior testable without linking a real linear-algebra
//! backend.

use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::instruction::Tile;
use async_trait::async_trait;

#[async_trait]
pub trait TileKernels: Send + Sync {
    /// In-place lower-triangular Cholesky factor of a symmetric
    /// positive-definite tile.
    async fn cholesky(&self, a: &Tile) -> Result<Tile>;

    /// Solve `X * diagᵀ = rhs` for X, where `diag` is lower-triangular.
    /// Mirrors `scipy.linalg.blas.dtrsm` with `side='R', trans='T'`.
    async fn trsm(&self, rhs: &Tile, diag: &Tile) -> Result<Tile>;

    /// `target - a * bᵀ`, the symmetric rank-k downdate.
    async fn syrk(&self, target: &Tile, a: &Tile, b: &Tile) -> Result<Tile>;

    /// `aᵀ * b`.
    async fn gemm(&self, a: &Tile, b: &Tile) -> Result<Tile>;
}

pub struct DenseKernels;

#[async_trait]
impl TileKernels for DenseKernels {
    async fn cholesky(&self, a: &Tile) -> Result<Tile> {
        let n = a.rows;
        if a.cols != n {
            return Err(RuntimeError::Kernel {
                block: 0,
                message: format!("cholesky requires a square tile, got {}x{}", a.rows, a.cols),
            });
        }
        let mut l = Tile::zeros(n, n);
        for i in 0..n {
            for j in 0..=i {
                let mut sum = a.get(i, j);
                for k in 0..j {
                    sum -= l.get(i, k) * l.get(j, k);
                }
                if i == j {
                    if sum <= 0.0 {
                        return Err(RuntimeError::Kernel {
                            block: 0,
                            message: "matrix is not positive definite".to_string(),
                        });
                    }
                    l.set(i, j, sum.sqrt());
                } else {
                    l.set(i, j, sum / l.get(j, j));
                }
            }
        }
        Ok(l)
    }

    async fn trsm(&self, rhs: &Tile, diag: &Tile) -> Result<Tile> {
        if diag.rows != diag.cols {
            return Err(RuntimeError::Kernel {
                block: 0,
                message: "trsm diagonal block must be square".to_string(),
            });
        }
        let (k, n) = rhs.shape();
        if n != diag.rows {
            return Err(RuntimeError::Kernel {
                block: 0,
                message: format!(
                    "trsm shape mismatch: rhs is {}x{}, diag is {}x{}",
                    rhs.rows, rhs.cols, diag.rows, diag.cols
                ),
            });
        }
        let mut out = Tile::zeros(k, n);
        for row in 0..k {
            for col in 0..n {
                let mut sum = rhs.get(row, col);
                for p in 0..col {
                    sum -= out.get(row, p) * diag.get(col, p);
                }
                out.set(row, col, sum / diag.get(col, col));
            }
        }
        Ok(out)
    }

    async fn syrk(&self, target: &Tile, a: &Tile, b: &Tile) -> Result<Tile> {
        if a.shape() != b.shape() {
            return Err(RuntimeError::Kernel {
                block: 0,
                message: "syrk operands must share shape".to_string(),
            });
        }
        let (m, k) = a.shape();
        if target.rows != m || target.cols != m {
            return Err(RuntimeError::Kernel {
                block: 0,
                message: format!(
                    "syrk target must be {0}x{0}, got {1}x{2}",
                    m, target.rows, target.cols
                ),
            });
        }
        let mut out = target.clone();
        for i in 0..m {
            for j in 0..m {
                let mut dot = 0.0;
                for p in 0..k {
                    dot += a.get(i, p) * b.get(j, p);
                }
                out.set(i, j, out.get(i, j) - dot);
            }
        }
        Ok(out)
    }

    async fn gemm(&self, a: &Tile, b: &Tile) -> Result<Tile> {
        if a.rows != b.rows {
            return Err(RuntimeError::Kernel {
                block: 0,
                message: format!(
                    "gemm contraction dim mismatch: a is {}x{}, b is {}x{}",
                    a.rows, a.cols, b.rows, b.cols
                ),
            });
        }
        let (k, m) = a.shape();
        let n = b.cols;
        let mut out = Tile::zeros(m, n);
        for i in 0..m {
            for j in 0..n {
                let mut dot = 0.0;
                for p in 0..k {
                    dot += a.get(p, i) * b.get(p, j);
                }
                out.set(i, j, dot);
            }
        }
        Ok(out)
    }
}

//! runtime/instruction.rs — the tagged instruction variant (spec §3) and
//! the dense tile payload it moves between loads, stores, and kernels.

use serde::{Deserialize, Serialize};

/// Opaque to the scheduler beyond equality and hashing: identifies one
/// shard of one distributed matrix. Used both as the cache key and as the
/// dependency key during read/write analysis (spec §4.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileRef {
    pub matrix_id: String,
    pub bucket: String,
    pub index: Vec<usize>,
}

impl TileRef {
    pub fn new(matrix_id: impl Into<String>, bucket: impl Into<String>, index: Vec<usize>) -> Self {
        TileRef {
            matrix_id: matrix_id.into(),
            bucket: bucket.into(),
            index,
        }
    }
}

impl std::fmt::Display for TileRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}{:?}", self.bucket, self.matrix_id, self.index)
    }
}

/// A dense row-major tile. Reference payload type for the in-process
/// `TileStore`/`TileKernels` implementations (spec §4.9) — real deployments
/// swap these for whatever the external tile-matrix store hands back.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl Tile {
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        assert_eq!(rows * cols, data.len(), "tile shape does not match data length");
        Tile { rows, cols, data }
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Tile {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.data[r * self.cols + c]
    }

    pub fn set(&mut self, r: usize, c: usize, v: f64) {
        self.data[r * self.cols + c] = v;
    }

    pub fn byte_size(&self) -> u64 {
        (self.data.len() * std::mem::size_of::<f64>()) as u64
    }

    pub fn transpose(&self) -> Tile {
        let mut out = Tile::zeros(self.cols, self.rows);
        for r in 0..self.rows {
            for c in 0..self.cols {
                out.set(c, r, self.get(r, c));
            }
        }
        out
    }
}

/// The operation carried by one `Instruction`. Operands for compute ops are
/// indices into the same block's instruction list — the block is always
/// executed in program order, so every operand index refers to an
/// already-completed sibling (spec §4.7, §5 "strict program order").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Op {
    Load {
        tile: TileRef,
    },
    Store {
        src: usize,
        tile: TileRef,
    },
    Chol {
        operand: usize,
    },
    Trsm {
        /// right-hand-side block (k×n), already loaded
        rhs: usize,
        /// lower-triangular diagonal block (n×n)
        diag: usize,
    },
    Syrk {
        /// C, updated in place: C - A·Bᵀ
        target: usize,
        a: usize,
        b: usize,
    },
    Gemm {
        a: usize,
        b: usize,
    },
    Ret {
        key: String,
    },
    Barrier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetCode {
    Pending,
    Success,
    Exception,
}

/// One remote operation. Timing/size/flops fields accumulate into the
/// program's global counters (spec §3); `result` is cleared at the end of
/// the owning block's post-op to bound worker memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    pub id: u64,
    pub op: Op,
    pub start_time_ms: Option<i64>,
    pub end_time_ms: Option<i64>,
    pub ret_code: RetCode,
    pub read_size: u64,
    pub write_size: u64,
    pub flops: f64,
    #[serde(skip)]
    pub result: Option<Tile>,
    #[serde(skip)]
    pub already_ran: bool,
}

impl Instruction {
    pub fn new(id: u64, op: Op) -> Self {
        Instruction {
            id,
            op,
            start_time_ms: None,
            end_time_ms: None,
            ret_code: RetCode::Pending,
            read_size: 0,
            write_size: 0,
            flops: 0.0,
            result: None,
            already_ran: false,
        }
    }

    pub fn clear(&mut self) {
        self.result = None;
    }

    pub fn is_load(&self) -> bool {
        matches!(self.op, Op::Load { .. })
    }

    pub fn is_store(&self) -> bool {
        matches!(self.op, Op::Store { .. })
    }

    pub fn tile_ref(&self) -> Option<&TileRef> {
        match &self.op {
            Op::Load { tile } | Op::Store { tile, .. } => Some(tile),
            _ => None,
        }
    }
}

/// Exact FLOPs formulas the scheduler's counters rely on (spec §4.7).
pub mod flops {
    pub fn chol(n: usize) -> f64 {
        let n = n as f64;
        n.powi(3) / 3.0 + 2.0 * n / 3.0
    }

    /// rhs is k×n, diag (the triangular block) is m×n.
    pub fn trsm(rhs_shape: (usize, usize), diag_shape: (usize, usize)) -> f64 {
        let k = rhs_shape.0 as f64;
        let (m, n) = (diag_shape.0 as f64, diag_shape.1 as f64);
        k * m * n
    }

    /// C is m×m (size = m*m elements); A, B are m×k.
    pub fn syrk(c_elems: usize, a_shape: (usize, usize), b_shape: (usize, usize)) -> f64 {
        let m = a_shape.0 as f64;
        let k = a_shape.1 as f64;
        debug_assert_eq!(b_shape.0, a_shape.0);
        c_elems as f64 + 2.0 * m * m * k
    }

    /// Aᵀ·B for A: k×m, B: k×n -> C: m×n. Not fixed by the design (no test
    /// depends on the exact constant) but kept to the conventional 2mnk.
    pub fn gemm(a_shape: (usize, usize), b_shape: (usize, usize)) -> f64 {
        let k = a_shape.0 as f64;
        let m = a_shape.1 as f64;
        let n = b_shape.1 as f64;
        debug_assert_eq!(b_shape.0, a_shape.0);
        2.0 * m * n * k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chol_flops_matches_formula() {
        // n=2: 8/3 + 4/3 = 4
        assert!((flops::chol(2) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn trsm_flops_matches_formula() {
        assert_eq!(flops::trsm((3, 2), (2, 2)), (3 * 2 * 2) as f64);
    }

    #[test]
    fn syrk_flops_matches_formula() {
        // C: 2x2 (4 elems), A/B: 2x3
        let val = flops::syrk(4, (2, 3), (2, 3));
        assert_eq!(val, 4.0 + 2.0 * 2.0 * 2.0 * 3.0);
    }

    #[test]
    fn tile_transpose_roundtrips() {
        let t = Tile::new(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let tt = t.transpose().transpose();
        assert_eq!(t, tt);
    }
}

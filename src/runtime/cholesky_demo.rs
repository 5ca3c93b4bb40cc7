//! runtime/cholesky_demo.rs — a small, fixed-shape DAG builder standing in
//! for the original system's general blocked-linear-algebra compiler
//! (`_chol`/`make_local_cholesky`/`make_column_update`/`make_low_rank_update`).
//! This module only ever builds the two demo DAGs the end-to-end scenarios
//! need: a single 1x1 tile and a 2x2 tile lower-triangular Cholesky
//! factorization. It is a demonstration driver, not a general compiler.

use crate::runtime::block::InstructionBlock;
use crate::runtime::instruction::{Instruction, Op, TileRef};
use crate::runtime::tile_store::TileStore;

pub const INPUT_MATRIX: &str = "A";
pub const OUTPUT_MATRIX: &str = "L";
pub const BUCKET: &str = "cholesky-demo";

pub fn tile(matrix: &str, row: usize, col: usize) -> TileRef {
    TileRef::new(matrix, BUCKET, vec![row, col])
}

/// `DAG for a single 1x1 tile: LOAD, CHOL, STORE, then the caller's EXIT
/// block. Matches the single-block-plus-EXIT scenario.
pub fn build_1x1() -> Vec<InstructionBlock> {
    let a00 = tile(INPUT_MATRIX, 0, 0);
    let l00 = tile(OUTPUT_MATRIX, 0, 0);
    let block = InstructionBlock::new(
        0,
        "local-chol",
        vec![
            Instruction::new(0, Op::Load { tile: a00 }),
            Instruction::new(1, Op::Chol { operand: 0 }),
            Instruction::new(2, Op::Store { src: 1, tile: l00 }),
        ],
    );
    vec![block]
}

/// DAG for a 2x2 tiling of a symmetric positive-definite matrix:
/// local-chol(A00) -> L00, column-update(A10, L00) -> L10,
/// low-rank-update(A11, L10) -> L11 (folding the trailing 1x1 Cholesky
/// into the same block, since the demo never recurses past one level).
pub fn build_2x2() -> Vec<InstructionBlock> {
    let a00 = tile(INPUT_MATRIX, 0, 0);
    let a10 = tile(INPUT_MATRIX, 1, 0);
    let a11 = tile(INPUT_MATRIX, 1, 1);
    let l00 = tile(OUTPUT_MATRIX, 0, 0);
    let l10 = tile(OUTPUT_MATRIX, 1, 0);
    let l11 = tile(OUTPUT_MATRIX, 1, 1);

    let local_chol = InstructionBlock::new(
        0,
        "local-chol",
        vec![
            Instruction::new(0, Op::Load { tile: a00 }),
            Instruction::new(1, Op::Chol { operand: 0 }),
            Instruction::new(2, Op::Store { src: 1, tile: l00.clone() }),
        ],
    );

    let column_update = InstructionBlock::new(
        1,
        "column-update",
        vec![
            Instruction::new(0, Op::Load { tile: a10 }),
            Instruction::new(1, Op::Load { tile: l00 }),
            Instruction::new(2, Op::Trsm { rhs: 0, diag: 1 }),
            Instruction::new(3, Op::Store { src: 2, tile: l10.clone() }),
        ],
    );

    let low_rank_update = InstructionBlock::new(
        2,
        "low-rank-update",
        vec![
            Instruction::new(0, Op::Load { tile: a11 }),
            Instruction::new(1, Op::Load { tile: l10.clone() }),
            Instruction::new(2, Op::Load { tile: l10 }),
            Instruction::new(3, Op::Syrk { target: 0, a: 1, b: 2 }),
            Instruction::new(4, Op::Chol { operand: 3 }),
            Instruction::new(5, Op::Store { src: 4, tile: l11 }),
        ],
    );

    vec![local_chol, column_update, low_rank_update]
}

pub async fn seed_1x1(tiles: &dyn TileStore, a00: f64) -> std::io::Result<()> {
    tiles
        .put_tile(&tile(INPUT_MATRIX, 0, 0), crate::runtime::instruction::Tile::new(1, 1, vec![a00]))
        .await
}

pub async fn seed_2x2(tiles: &dyn TileStore, a00: f64, a10: f64, a11: f64) -> std::io::Result<()> {
    tiles
        .put_tile(&tile(INPUT_MATRIX, 0, 0), crate::runtime::instruction::Tile::new(1, 1, vec![a00]))
        .await?;
    tiles
        .put_tile(&tile(INPUT_MATRIX, 1, 0), crate::runtime::instruction::Tile::new(1, 1, vec![a10]))
        .await?;
    tiles
        .put_tile(&tile(INPUT_MATRIX, 1, 1), crate::runtime::instruction::Tile::new(1, 1, vec![a11]))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::program::Program;

    #[test]
    fn build_1x1_is_one_compute_block() {
        let blocks = build_1x1();
        assert_eq!(blocks.len(), 1);
        let program = Program::build(blocks, 1, 1.0, 1.0, false).unwrap();
        assert_eq!(program.blocks.len(), 2, "one compute block plus EXIT");
        assert_eq!(program.critical_path_len(), 2);
    }

    #[test]
    fn build_2x2_has_the_expected_shape() {
        let blocks = build_2x2();
        assert_eq!(blocks.len(), 3);
        let program = Program::build(blocks, 2, 1.0, 1.0, false).unwrap();
        assert_eq!(program.blocks.len(), 4, "three compute blocks plus EXIT");
        assert_eq!(program.starters, vec![0]);
        assert_eq!(program.terminators, vec![2]);
    }
}

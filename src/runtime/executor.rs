//! runtime/executor.rs — runs one block end-to-end on behalf of the worker
//! loop (spec §4.6). Owns the per-execution working copy of the block (the
//! Open Question resolution in SPEC_FULL.md §9: no per-task deep copy of
//! the whole `Program`, just this one block's instructions).

use crate::runtime::block::InstructionBlock;
use crate::runtime::cache::LruCache;
use crate::runtime::config::WorkerConfig;
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::instruction::{Op, RetCode};
use crate::runtime::node_state::NodeStatus;
use crate::runtime::program::{Collaborators, Program};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

pub struct Executor<'a> {
    program: &'a Program,
    collaborators: &'a Collaborators,
    cache: Arc<tokio::sync::Mutex<LruCache>>,
    config: &'a WorkerConfig,
}

impl<'a> Executor<'a> {
    pub fn new(
        program: &'a Program,
        collaborators: &'a Collaborators,
        cache: Arc<tokio::sync::Mutex<LruCache>>,
        config: &'a WorkerConfig,
    ) -> Self {
        Executor {
            program,
            collaborators,
            cache,
            config,
        }
    }

    /// Runs a seeded work list of PCs, appending eagerly-fused next PCs as
    /// post-op returns them (spec §4.6 — "implements eager fusion without
    /// recursion"). Returns the number of blocks actually executed, for the
    /// worker's busy-time accounting.
    #[instrument(skip(self), fields(program = %self.program.program_hash))]
    pub async fn run(&self, starting_pc: usize) -> Result<usize> {
        let mut work = vec![starting_pc];
        let mut executed_count = 0;
        while let Some(pc) = work.pop() {
            let next = self.run_one(pc).await?;
            executed_count += 1;
            if let Some(n) = next {
                work.push(n);
            }
        }
        Ok(executed_count)
    }

    async fn run_one(&self, pc: usize) -> Result<Option<usize>> {
        let status = self.program.node_status(self.collaborators, pc).await?;
        match status {
            NodeStatus::Ready => {
                self.program.mark_running(self.collaborators, pc).await?;
                let mut working = self.program.blocks[pc].clone();
                self.execute_block(&mut working).await?;
                self.program
                    .post_op(
                        self.collaborators,
                        &mut working,
                        RetCode::Success,
                        None,
                        self.config.cas_timeout(),
                    )
                    .await
            }
            NodeStatus::Running => {
                let mut working = self.program.blocks[pc].clone();
                self.execute_block(&mut working).await?;
                self.program
                    .post_op(
                        self.collaborators,
                        &mut working,
                        RetCode::Success,
                        None,
                        self.config.cas_timeout(),
                    )
                    .await
            }
            NodeStatus::PostOp => {
                let mut working = self.program.blocks[pc].clone();
                self.program
                    .post_op(
                        self.collaborators,
                        &mut working,
                        RetCode::Success,
                        None,
                        self.config.cas_timeout(),
                    )
                    .await
            }
            NodeStatus::Finished => Ok(None),
            NodeStatus::NotReady => {
                warn!(block = pc, "NOT_READY reached the executor; spurious delivery, skipping");
                Ok(None)
            }
        }
    }

    /// Executes every instruction in `block` in strict program order (spec
    /// §4.7, §5). On kernel failure, drives post-op with EXCEPTION and
    /// re-raises to the caller, matching spec §4.6 step 6.
    async fn execute_block(&self, block: &mut InstructionBlock) -> Result<()> {
        block.start_time_ms = Some(chrono::Utc::now().timestamp_millis());
        let result = self.run_instructions(block).await;
        block.end_time_ms = Some(chrono::Utc::now().timestamp_millis());
        if let Err(e) = result {
            error!(block = block.id, error = %e, "block execution failed");
            let _ = self.collaborators.kv.decr("poolsize", 1).await;
            let _ = self.collaborators.kv.decr("up", 1).await;
            let mut failed = block.clone();
            let _ = self
                .program
                .post_op(
                    self.collaborators,
                    &mut failed,
                    RetCode::Exception,
                    Some(e.to_string()),
                    self.config.cas_timeout(),
                )
                .await;
            return Err(e);
        }
        Ok(())
    }

    async fn run_instructions(&self, block: &mut InstructionBlock) -> Result<()> {
        let n = block.instrs.len();
        for idx in 0..n {
            if block.instrs[idx].already_ran {
                return Err(RuntimeError::ReplayDetected(block.instrs[idx].id));
            }
            block.instrs[idx].start_time_ms = Some(chrono::Utc::now().timestamp_millis());
            let outcome = self.run_instruction(block, idx).await;
            block.instrs[idx].end_time_ms = Some(chrono::Utc::now().timestamp_millis());
            block.instrs[idx].ret_code = if outcome.is_ok() {
                crate::runtime::instruction::RetCode::Success
            } else {
                crate::runtime::instruction::RetCode::Exception
            };
            outcome?;
            block.instrs[idx].already_ran = true;
        }
        Ok(())
    }

    async fn run_instruction(&self, block: &mut InstructionBlock, idx: usize) -> Result<()> {
        let op = block.instrs[idx].op.clone();
        match op {
            Op::Load { tile } => {
                if let Some(hit) = self.cache.lock().await.get(&tile) {
                    block.instrs[idx].read_size = hit.byte_size();
                    block.instrs[idx].result = Some((*hit).clone());
                    return Ok(());
                }
                let data = self.load_with_retry(&tile).await?;
                block.instrs[idx].read_size = data.byte_size();
                self.cache.lock().await.put(tile, data.clone());
                block.instrs[idx].result = Some(data);
            }
            Op::Store { src, tile } => {
                let data = block.instrs[src]
                    .result
                    .clone()
                    .ok_or_else(|| RuntimeError::Kernel {
                        block: block.id,
                        message: format!("store at instruction {} has no source result", idx),
                    })?;
                self.store_with_retry(&tile, data.clone()).await?;
                block.instrs[idx].write_size = data.byte_size();
                self.cache.lock().await.put(tile, data);
            }
            Op::Chol { operand } => {
                let a = operand_tile(block, operand)?;
                let l = self.collaborators.kernels.cholesky(&a).await?;
                block.instrs[idx].flops = crate::runtime::instruction::flops::chol(a.rows);
                block.instrs[idx].result = Some(l);
            }
            Op::Trsm { rhs, diag } => {
                let rhs_tile = operand_tile(block, rhs)?;
                let diag_tile = operand_tile(block, diag)?;
                let out = self.collaborators.kernels.trsm(&rhs_tile, &diag_tile).await?;
                block.instrs[idx].flops =
                    crate::runtime::instruction::flops::trsm(rhs_tile.shape(), diag_tile.shape());
                block.instrs[idx].result = Some(out);
            }
            Op::Syrk { target, a, b } => {
                let target_tile = operand_tile(block, target)?;
                let a_tile = operand_tile(block, a)?;
                let b_tile = operand_tile(block, b)?;
                let out = self
                    .collaborators
                    .kernels
                    .syrk(&target_tile, &a_tile, &b_tile)
                    .await?;
                block.instrs[idx].flops = crate::runtime::instruction::flops::syrk(
                    target_tile.rows * target_tile.cols,
                    a_tile.shape(),
                    b_tile.shape(),
                );
                block.instrs[idx].result = Some(out);
            }
            Op::Gemm { a, b } => {
                let a_tile = operand_tile(block, a)?;
                let b_tile = operand_tile(block, b)?;
                let out = self.collaborators.kernels.gemm(&a_tile, &b_tile).await?;
                block.instrs[idx].flops =
                    crate::runtime::instruction::flops::gemm(a_tile.shape(), b_tile.shape());
                block.instrs[idx].result = Some(out);
            }
            Op::Ret { key } => {
                // A RET signals this path finished; it must not downgrade
                // a program that has already been marked EXCEPTION by an
                // earlier failing block's post-op (spec §4.4 step 3 —
                // propagation continues so terminators still close out,
                // but the exception verdict sticks).
                use crate::runtime::node_state::ProgramStatus;
                let current = self.collaborators.kv.get(&key).await?;
                if current != Some(ProgramStatus::Exception.as_i64()) {
                    self.collaborators.kv.put(&key, ProgramStatus::Success.as_i64()).await?;
                }
            }
            Op::Barrier => {}
        }
        Ok(())
    }

    async fn load_with_retry(
        &self,
        tile: &crate::runtime::instruction::TileRef,
    ) -> Result<crate::runtime::instruction::Tile> {
        let mut attempt = 0u32;
        let max_attempt_time = Duration::from_secs(self.config.max_read_time_secs);
        loop {
            attempt += 1;
            let attempt_start = Instant::now();
            match tokio::time::timeout(max_attempt_time, self.collaborators.tiles.get_tile(tile))
                .await
            {
                Ok(Ok(tile_data)) => return Ok(tile_data),
                Ok(Err(e)) if attempt < 5 => {
                    self.backoff(attempt).await;
                    info!(tile = %tile, attempt, elapsed = ?attempt_start.elapsed(), "transient load error {e}, retrying");
                }
                Ok(Err(e)) => {
                    return Err(RuntimeError::TransientIo {
                        tile: tile.clone(),
                        attempts: attempt,
                        source: Box::new(e),
                    })
                }
                Err(_) if attempt < 5 => self.backoff(attempt).await,
                Err(_) => {
                    return Err(RuntimeError::TransientIo {
                        tile: tile.clone(),
                        attempts: attempt,
                        source: Box::new(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "tile load timed out",
                        )),
                    })
                }
            }
        }
    }

    async fn store_with_retry(
        &self,
        tile: &crate::runtime::instruction::TileRef,
        data: crate::runtime::instruction::Tile,
    ) -> Result<()> {
        let mut attempt = 0u32;
        let max_attempt_time = Duration::from_secs(self.config.max_write_time_secs);
        loop {
            attempt += 1;
            match tokio::time::timeout(
                max_attempt_time,
                self.collaborators.tiles.put_tile(tile, data.clone()),
            )
            .await
            {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) if attempt < 5 => {
                    info!(tile = %tile, attempt, "transient store error {e}, retrying");
                    self.backoff(attempt).await;
                }
                Ok(Err(e)) => {
                    return Err(RuntimeError::TransientIo {
                        tile: tile.clone(),
                        attempts: attempt,
                        source: Box::new(e),
                    })
                }
                Err(_) if attempt < 5 => self.backoff(attempt).await,
                Err(_) => {
                    return Err(RuntimeError::TransientIo {
                        tile: tile.clone(),
                        attempts: attempt,
                        source: Box::new(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "tile store timed out",
                        )),
                    })
                }
            }
        }
    }

    async fn backoff(&self, attempt: u32) {
        let delay = self.config.backoff_base_ms * 2u64.pow(attempt.saturating_sub(1));
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}

fn operand_tile(
    block: &InstructionBlock,
    idx: usize,
) -> Result<crate::runtime::instruction::Tile> {
    block.instrs[idx]
        .result
        .clone()
        .ok_or_else(|| RuntimeError::Kernel {
            block: block.id,
            message: format!("operand instruction {} produced no result", idx),
        })
}

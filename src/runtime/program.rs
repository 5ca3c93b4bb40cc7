//! runtime/program.rs — the DAG over blocks: dependency analysis,
//! critical-path priority donation, per-node/per-edge state in the KV
//! store, the post-op protocol, queue creation, global counters, and
//! profiling persistence (spec §3, §4.1–§4.5, §4.11).
//!
//! `Program` itself is immutable read-only metadata, shared as `Arc` across
//! every pipeline slot of every worker (see the Open Question resolution in
//! SPEC_FULL.md §9): it carries no per-execution state. Per-execution
//! instruction results live on the executing task's own `InstructionBlock`
//! working copy, never on `self.blocks`.

use crate::runtime::block::InstructionBlock;
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::instruction::{Op, RetCode, TileRef};
use crate::runtime::kernels::TileKernels;
use crate::runtime::kv::KvStore;
use crate::runtime::node_state::{EdgeStatus, NodeStatus, ProgramStatus};
use crate::runtime::object_store::ObjectStore;
use crate::runtime::queue::QueueService;
use crate::runtime::tile_store::TileStore;
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Scale factor to carry a float FLOPs counter through an integer-only KV
/// store (spec's KV store is a plain `get`/`incr`/`decr`/CAS contract, no
/// float increment). Six decimal digits of fractional precision is far
/// more than any FLOPs comparison in this crate needs.
const FLOPS_FIXED_POINT: f64 = 1_000_000.0;

/// Bundles the five external collaborators (spec §6) a running program
/// needs. Cheap to clone (every field is an `Arc`); one instance is shared
/// by every worker in a cluster talking to the same backends.
#[derive(Clone)]
pub struct Collaborators {
    pub kv: Arc<dyn KvStore>,
    pub queue: Arc<dyn QueueService>,
    pub objects: Arc<dyn ObjectStore>,
    pub tiles: Arc<dyn TileStore>,
    pub kernels: Arc<dyn TileKernels>,
}

pub struct Program {
    pub blocks: Vec<InstructionBlock>,
    pub parents: Vec<HashSet<usize>>,
    pub children: Vec<HashSet<usize>>,
    pub starters: Vec<usize>,
    pub terminators: Vec<usize>,
    pub exit_block: usize,
    pub program_hash: String,
    pub max_priority: usize,
    pub io_rate: f64,
    pub flop_rate: f64,
    pub eager: bool,
    critical_dist: Vec<i64>,
}

impl Program {
    /// Builds a `Program` from a topologically-consistent block list (spec
    /// §4.1): runs read/write dependency analysis, appends the synthetic
    /// EXIT block, and donates priorities along the critical path (§4.2).
    pub fn build(
        mut blocks: Vec<InstructionBlock>,
        max_priority: usize,
        io_rate: f64,
        flop_rate: f64,
        eager: bool,
    ) -> Result<Program> {
        for b in &blocks {
            b.validate().map_err(RuntimeError::Construction)?;
        }

        let (parents, children) = analyze_dependencies(&blocks)?;
        let n = blocks.len();
        let terminators: Vec<usize> = (0..n).filter(|&i| children[i].is_empty()).collect();
        let starters: Vec<usize> = (0..n).filter(|&i| parents[i].is_empty()).collect();

        let program_hash = compute_program_hash(&blocks);

        let exit_id = blocks.iter().map(|b| b.id).max().map_or(0, |m| m + 1);
        let exit_instr_id = blocks
            .iter()
            .flat_map(|b| b.instrs.iter().map(|i| i.id))
            .max()
            .map_or(0, |m| m + 1);
        let exit_instr = crate::runtime::instruction::Instruction::new(
            exit_instr_id,
            Op::Ret {
                key: program_hash.clone(),
            },
        );
        let exit_index = n;
        let mut exit_block = InstructionBlock::new(exit_id, "EXIT", vec![exit_instr]);
        exit_block.priority = max_priority;
        blocks.push(exit_block);

        let mut parents = parents;
        let mut children = children;
        parents.push(terminators.iter().copied().collect());
        children.push(HashSet::new());
        for &t in &terminators {
            children[t].insert(exit_index);
        }

        let mut program = Program {
            blocks,
            parents,
            children,
            starters,
            terminators,
            exit_block: exit_index,
            program_hash,
            max_priority,
            io_rate,
            flop_rate,
            eager,
            critical_dist: Vec::new(),
        };
        program.assign_priorities();
        Ok(program)
    }

    fn assign_priorities(&mut self) {
        let n = self.blocks.len();
        let mut dist = vec![1i64; n];
        let mut best_parent: Vec<Option<usize>> = vec![None; n];
        for i in 0..n {
            for &p in &self.parents[i] {
                if p < n && dist[p] + 1 > dist[i] {
                    dist[i] = dist[p] + 1;
                    best_parent[i] = Some(p);
                }
            }
        }
        let (end, _) = dist
            .iter()
            .enumerate()
            .max_by_key(|&(_, &d)| d)
            .expect("program has at least one block (EXIT)");

        let mut path = vec![end];
        let mut cur = end;
        while let Some(p) = best_parent[cur] {
            path.push(p);
            cur = p;
        }
        for &node in &path {
            self.donate_from(node, self.max_priority);
        }
        self.critical_dist = dist;
    }

    /// Walks ancestors of `start` up to `max_priority` hops, setting each
    /// one's priority to `max(current, max_priority - depth)` (spec §4.2).
    fn donate_from(&mut self, start: usize, max_priority: usize) {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back((start, 0usize));
        visited.insert(start);
        while let Some((node, depth)) = queue.pop_front() {
            let donated = max_priority.saturating_sub(depth);
            self.blocks[node].donate_priority(donated, max_priority);
            if depth >= max_priority {
                continue;
            }
            let parents_of_node: Vec<usize> = self.parents[node].iter().copied().collect();
            for p in parents_of_node {
                if visited.insert(p) {
                    queue.push_back((p, depth + 1));
                }
            }
        }
    }

    pub fn critical_path_len(&self) -> i64 {
        self.critical_dist[self.exit_block]
    }

    fn key_node(&self, i: usize) -> String {
        format!("node:{}:{}", self.program_hash, i)
    }

    fn key_edge(&self, i: usize, j: usize) -> String {
        format!("edge:{}:{}:{}", self.program_hash, i, j)
    }

    fn key_edgesum(&self, j: usize) -> String {
        format!("edgesum:{}:{}", self.program_hash, j)
    }

    fn key_sqsmeta(&self, i: usize, j: usize) -> String {
        format!("sqsmeta:{}:{}:{}", self.program_hash, i, j)
    }

    fn key_max(&self) -> String {
        format!("{}_max", self.program_hash)
    }

    pub async fn node_status(&self, c: &Collaborators, i: usize) -> Result<NodeStatus> {
        let v = c.kv.get(&self.key_node(i)).await?;
        Ok(NodeStatus::from_i64(v.unwrap_or(0)))
    }

    async fn set_node_status(&self, c: &Collaborators, i: usize, s: NodeStatus) -> Result<()> {
        c.kv.put(&self.key_node(i), s.as_i64()).await
    }

    /// Drives the READY → RUNNING transition (spec §4.3, §4.6 step 2). The
    /// executor calls this before running a block's instructions so the
    /// state machine reflects "in flight" rather than staying at READY for
    /// the whole execution.
    pub async fn mark_running(&self, c: &Collaborators, i: usize) -> Result<()> {
        self.set_node_status(c, i, NodeStatus::Running).await
    }

    pub async fn program_status(&self, c: &Collaborators) -> Result<ProgramStatus> {
        let v = c.kv.get(&self.program_hash).await?;
        Ok(ProgramStatus::from_i64(v.unwrap_or(0)))
    }

    async fn set_program_status(&self, c: &Collaborators, s: ProgramStatus) -> Result<()> {
        c.kv.put(&self.program_hash, s.as_i64()).await
    }

    fn priority_of(&self, i: usize) -> usize {
        self.blocks[i].priority
    }

    async fn enqueue(&self, c: &Collaborators, i: usize) -> Result<()> {
        let priority = self.priority_of(i);
        c.queue.send(priority, i.to_string()).await?;
        c.kv.put(&self.key_max(), i as i64).await?;
        Ok(())
    }

    /// Program lifecycle: start (spec §6). Purges every priority queue,
    /// marks the program RUNNING, and enqueues the starter blocks.
    pub async fn start(&self, c: &Collaborators) -> Result<()> {
        for p in 0..=self.max_priority {
            c.queue.purge(p).await?;
        }
        self.set_program_status(c, ProgramStatus::Running).await?;
        for &s in &self.starters {
            self.set_node_status(c, s, NodeStatus::Ready).await?;
            self.enqueue(c, s).await?;
        }
        Ok(())
    }

    /// Polls `program_status` until it settles to SUCCESS or EXCEPTION.
    pub async fn wait(&self, c: &Collaborators, poll_interval: Duration) -> Result<ProgramStatus> {
        loop {
            match self.program_status(c).await? {
                s @ (ProgramStatus::Success | ProgramStatus::Exception) => return Ok(s),
                _ => tokio::time::sleep(poll_interval).await,
            }
        }
    }

    /// Program lifecycle: free (spec §6) — deletes (purges) every priority
    /// queue.
    pub async fn free(&self, c: &Collaborators) -> Result<()> {
        for p in 0..=self.max_priority {
            c.queue.purge(p).await?;
        }
        Ok(())
    }

    /// `read`/`write` bytes moved at `io_rate` bytes/sec plus `flops` done at
    /// `flop_rate` flops/sec, matching the original's rate-based duration
    /// estimate (spec's original system; not itself part of any invariant).
    fn estimate_duration_ms(&self, read: u64, write: u64, flops: f64) -> i64 {
        let io_secs = if self.io_rate > 0.0 {
            (read + write) as f64 / self.io_rate
        } else {
            0.0
        };
        let compute_secs = if self.flop_rate > 0.0 {
            flops / self.flop_rate
        } else {
            0.0
        };
        ((io_secs + compute_secs) * 1000.0).round() as i64
    }

    /// Bumps the global `flops`/`read`/`write` counters exactly once per
    /// block, guarded by `KvStore::claim_once` (spec §4.4/§4.5): `post_op`
    /// can re-enter on a `POST_OP` re-delivery or race with another worker
    /// executing the same block, and a plain `incr` here would double-count
    /// under either (spec §8 property 4, `program.flops == Σ flops(block)`).
    async fn record_counters(
        &self,
        c: &Collaborators,
        cas_timeout: Duration,
        executed: &mut InstructionBlock,
    ) -> Result<()> {
        let claim_key = format!("counted:{}:{}", self.program_hash, executed.id);
        let first_time = c.kv.claim_once(&claim_key, cas_timeout).await?;

        let read = executed.total_read();
        let write = executed.total_write();
        let flops = executed.total_flops();
        executed.estimated_duration_ms = Some(self.estimate_duration_ms(read, write, flops));

        if !first_time {
            return Ok(());
        }
        let flops_fixed = (flops * FLOPS_FIXED_POINT).round() as i64;
        c.kv.incr("flops", flops_fixed).await?;
        c.kv.incr("read", read as i64).await?;
        c.kv.incr("write", write as i64).await?;
        Ok(())
    }

    pub async fn total_flops(&self, c: &Collaborators) -> Result<f64> {
        let raw = c.kv.get("flops").await?.unwrap_or(0);
        Ok(raw as f64 / FLOPS_FIXED_POINT)
    }

    pub async fn total_read(&self, c: &Collaborators) -> Result<i64> {
        Ok(c.kv.get("read").await?.unwrap_or(0))
    }

    pub async fn total_write(&self, c: &Collaborators) -> Result<i64> {
        Ok(c.kv.get("write").await?.unwrap_or(0))
    }

    /// The post-op protocol (spec §4.4) — the heart of correctness. Called
    /// by the Executor once block `executed.id`'s instructions have run (or
    /// immediately, with `FINISHED` already set, for a re-delivered
    /// message). Returns the next PC to run in-line when eager fusion picks
    /// one.
    pub async fn post_op(
        &self,
        c: &Collaborators,
        executed: &mut InstructionBlock,
        ret_code: RetCode,
        traceback: Option<String>,
        cas_timeout: Duration,
    ) -> Result<Option<usize>> {
        let i = executed.id as usize;
        if matches!(self.node_status(c, i).await?, NodeStatus::Finished) {
            return Ok(None);
        }
        self.set_node_status(c, i, NodeStatus::PostOp).await?;

        if matches!(ret_code, RetCode::Exception) {
            let key = format!("{}/EXCEPTION.{}", self.program_hash, i);
            c.objects
                .put_object(&key, traceback.unwrap_or_default().into_bytes())
                .await?;
            self.set_program_status(c, ProgramStatus::Exception)
                .await?;
        }

        let mut ready_children = Vec::new();
        let children: Vec<usize> = self.children[i].iter().copied().collect();
        for child in children {
            let edge_key = self.key_edge(i, child);
            let sum_key = self.key_edgesum(child);
            c.kv.put(&self.key_sqsmeta(i, child), EdgeStatus::NotReady.as_i64())
                .await?;

            let new_val = c
                .kv
                .conditional_increment(&sum_key, &edge_key, cas_timeout)
                .await?;

            if new_val as usize == self.parents[child].len()
                && !matches!(self.node_status(c, child).await?, NodeStatus::Finished)
            {
                self.set_node_status(c, child, NodeStatus::Ready).await?;
                ready_children.push(child);
            }
        }

        let mut next_pc = None;
        if self.eager && !ready_children.is_empty() {
            let best_pos = ready_children
                .iter()
                .enumerate()
                .min_by_key(|&(_, &b)| (std::cmp::Reverse(self.priority_of(b)), b))
                .map(|(pos, _)| pos);
            if let Some(pos) = best_pos {
                next_pc = Some(ready_children.remove(pos));
            }
        }

        for child in ready_children {
            self.enqueue(c, child).await?;
        }

        executed.clear();
        self.record_counters(c, cas_timeout, executed).await?;
        let profile_bytes = bincode::serialize(executed)
            .map_err(|e| RuntimeError::ObjectStore(e.to_string()))?;
        c.objects
            .put_object(&format!("{}/{}", self.program_hash, i), profile_bytes)
            .await?;

        self.set_node_status(c, i, NodeStatus::Finished).await?;
        Ok(next_pc)
    }
}

fn analyze_dependencies(
    blocks: &[InstructionBlock],
) -> Result<(Vec<HashSet<usize>>, Vec<HashSet<usize>>)> {
    let mut writer_of: HashMap<TileRef, usize> = HashMap::new();
    let mut writer_count: HashMap<TileRef, usize> = HashMap::new();
    let mut readers_of: HashMap<TileRef, Vec<usize>> = HashMap::new();

    for (bi, block) in blocks.iter().enumerate() {
        for ins in &block.instrs {
            match &ins.op {
                Op::Store { tile, .. } => {
                    let count = writer_count.entry(tile.clone()).or_insert(0);
                    *count += 1;
                    if *count > 1 {
                        return Err(RuntimeError::NonSingleAssignment(tile.clone(), *count));
                    }
                    writer_of.insert(tile.clone(), bi);
                }
                Op::Load { tile } => {
                    readers_of.entry(tile.clone()).or_default().push(bi);
                }
                _ => {}
            }
        }
    }

    let n = blocks.len();
    let mut parents: Vec<HashSet<usize>> = vec![HashSet::new(); n];
    let mut children: Vec<HashSet<usize>> = vec![HashSet::new(); n];
    for (tile, readers) in &readers_of {
        if let Some(&writer) = writer_of.get(tile) {
            for &reader in readers {
                if reader != writer {
                    parents[reader].insert(writer);
                    children[writer].insert(reader);
                }
            }
        } else {
            debug!(?tile, "tile loaded with no writer in this program; treated as externally-seeded input");
        }
    }
    Ok((parents, children))
}

fn compute_program_hash(blocks: &[InstructionBlock]) -> String {
    let text = serde_json::to_string(blocks).unwrap_or_default();
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut hasher = Sha1::new();
    hasher.update(text.as_bytes());
    hasher.update(now.as_nanos().to_string().as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::instruction::{Instruction, Op, TileRef};
    use crate::runtime::kernels::DenseKernels;
    use crate::runtime::kv::InMemoryKv;
    use crate::runtime::object_store::InMemoryObjectStore;
    use crate::runtime::queue::InMemoryQueue;
    use crate::runtime::tile_store::InMemoryTileStore;

    fn collaborators(num_priorities: usize) -> Collaborators {
        Collaborators {
            kv: Arc::new(InMemoryKv::new()),
            queue: Arc::new(InMemoryQueue::new(num_priorities)),
            objects: Arc::new(InMemoryObjectStore::new()),
            tiles: Arc::new(InMemoryTileStore::new()),
            kernels: Arc::new(DenseKernels),
        }
    }

    fn single_block_program() -> Program {
        let a = TileRef::new("A", "b", vec![0, 0]);
        let block = InstructionBlock::new(
            0,
            "only",
            vec![
                Instruction::new(0, Op::Load { tile: a.clone() }),
                Instruction::new(1, Op::Store { src: 0, tile: a }),
            ],
        );
        Program::build(vec![block], 2, 1.0, 1.0, false).unwrap()
    }

    #[test]
    fn rejects_multiple_writers_to_same_tile() {
        let a = TileRef::new("A", "b", vec![0, 0]);
        let b1 = InstructionBlock::new(
            0,
            "w1",
            vec![Instruction::new(0, Op::Store { src: 0, tile: a.clone() })],
        );
        let b2 = InstructionBlock::new(1, "w2", vec![Instruction::new(0, Op::Store { src: 0, tile: a })]);
        let err = Program::build(vec![b1, b2], 1, 1.0, 1.0, false).unwrap_err();
        assert!(matches!(err, RuntimeError::NonSingleAssignment(_, 2)));
    }

    #[test]
    fn single_block_program_has_exit_as_only_successor() {
        let program = single_block_program();
        assert_eq!(program.blocks.len(), 2);
        assert_eq!(program.exit_block, 1);
        assert_eq!(program.starters, vec![0]);
        assert_eq!(program.critical_path_len(), 2);
    }

    #[test]
    fn critical_path_gets_max_priority() {
        let program = single_block_program();
        assert_eq!(program.blocks[0].priority, program.max_priority);
        assert_eq!(program.blocks[program.exit_block].priority, program.max_priority);
    }

    #[tokio::test]
    async fn start_enqueues_starters_and_sets_running() {
        let program = single_block_program();
        let c = collaborators(program.max_priority + 1);
        program.start(&c).await.unwrap();
        assert_eq!(
            program.program_status(&c).await.unwrap(),
            ProgramStatus::Running
        );
        let msg = c
            .queue
            .receive(program.priority_of(0), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(msg.is_some());
    }

    #[tokio::test]
    async fn post_op_on_last_terminator_enqueues_exit() {
        let program = single_block_program();
        let c = collaborators(program.max_priority + 1);
        program.start(&c).await.unwrap();
        let mut executed = program.blocks[0].clone();
        let next = program
            .post_op(&c, &mut executed, RetCode::Success, None, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(next.is_none(), "eager is disabled in this program");
        assert_eq!(
            program.node_status(&c, program.exit_block).await.unwrap(),
            NodeStatus::Ready
        );
        let msg = c
            .queue
            .receive(program.priority_of(program.exit_block), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(msg.unwrap().body, program.exit_block.to_string());
    }

    #[tokio::test]
    async fn duplicate_post_op_does_not_double_increment_edgesum() {
        let program = single_block_program();
        let c = collaborators(program.max_priority + 1);
        program.start(&c).await.unwrap();
        let mut executed = program.blocks[0].clone();
        program
            .post_op(&c, &mut executed.clone(), RetCode::Success, None, Duration::from_secs(60))
            .await
            .unwrap();
        // second, duplicate delivery of the same finished node is a no-op
        let again = program
            .post_op(&c, &mut executed, RetCode::Success, None, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(again.is_none());
        let sum = c
            .kv
            .get(&program.key_edgesum(program.exit_block))
            .await
            .unwrap();
        assert_eq!(sum, Some(1));
    }

    #[tokio::test]
    async fn concurrent_post_op_does_not_double_count_global_counters() {
        let program = single_block_program();
        let c = collaborators(program.max_priority + 1);
        program.start(&c).await.unwrap();

        let mut block_a = program.blocks[0].clone();
        block_a.instrs[0].read_size = 100;
        let mut block_b = block_a.clone();

        let (r1, r2) = tokio::join!(
            program.post_op(&c, &mut block_a, RetCode::Success, None, Duration::from_secs(60)),
            program.post_op(&c, &mut block_b, RetCode::Success, None, Duration::from_secs(60)),
        );
        r1.unwrap();
        r2.unwrap();

        assert_eq!(
            program.total_read(&c).await.unwrap(),
            100,
            "two racing post_op calls for the same block must count its read bytes once, not twice"
        );
    }

    #[tokio::test]
    async fn exception_ret_code_marks_program_exception_and_persists_traceback() {
        let program = single_block_program();
        let c = collaborators(program.max_priority + 1);
        program.start(&c).await.unwrap();
        let mut executed = program.blocks[0].clone();
        program
            .post_op(
                &c,
                &mut executed,
                RetCode::Exception,
                Some("boom".into()),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(
            program.program_status(&c).await.unwrap(),
            ProgramStatus::Exception
        );
        let obj = c
            .objects
            .get_object(&format!("{}/EXCEPTION.0", program.program_hash))
            .await
            .unwrap();
        assert_eq!(obj, Some(b"boom".to_vec()));
    }
}

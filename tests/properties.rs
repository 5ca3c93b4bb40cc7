//! Quantified invariants from spec §8, exercised with randomized orderings
//! rather than a single fixed sequence.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

use tiledagrt::runtime::cholesky_demo;
use tiledagrt::runtime::kernels::DenseKernels;
use tiledagrt::runtime::kv::{InMemoryKv, KvStore};
use tiledagrt::runtime::object_store::InMemoryObjectStore;
use tiledagrt::runtime::queue::InMemoryQueue;
use tiledagrt::runtime::tile_store::InMemoryTileStore;
use tiledagrt::{Collaborators, NodeStatus, Program, RetCode};

fn collaborators(num_priorities: usize) -> Collaborators {
    Collaborators {
        kv: Arc::new(InMemoryKv::new()),
        queue: Arc::new(InMemoryQueue::new(num_priorities)),
        objects: Arc::new(InMemoryObjectStore::new()),
        tiles: Arc::new(InMemoryTileStore::new()),
        kernels: Arc::new(DenseKernels),
    }
}

/// Invariant 1 — single delivery: for a fixed DAG, firing every block's
/// post-op some random number of extra duplicate times, in a shuffled
/// order, never lets a child's edgesum exceed its in-degree, and every
/// child still reaches FINISHED exactly once.
#[tokio::test]
async fn single_delivery_holds_under_shuffled_duplicate_post_ops() {
    for seed in 0u64..8 {
        let mut rng = StdRng::seed_from_u64(seed);
        let blocks = cholesky_demo::build_2x2();
        let program = Program::build(blocks, 2, 1.0, 1.0, false).unwrap();
        let c = collaborators(program.max_priority + 1);
        program.start(&c).await.unwrap();

        // Every block (including EXIT) gets 1-4 duplicate post-op
        // deliveries, fired in a shuffled order. EXIT's own post-op must
        // still run for it to reach FINISHED, even though it has no
        // children to propagate to.
        let mut deliveries: Vec<usize> = Vec::new();
        for i in 0..program.blocks.len() {
            let copies = rng.gen_range(1..=4);
            for _ in 0..copies {
                deliveries.push(i);
            }
        }
        deliveries.shuffle(&mut rng);

        // Fired in shuffled order, one at a time: this exercises arbitrary
        // *interleaving* of duplicate deliveries (spec's "every ordering,
        // including duplicates") without needing a 'static task spawn for
        // each one — true concurrent-delivery safety of the conditional
        // increment itself is covered by `runtime::kv`'s own concurrency
        // test, which spawns real tasks against a shared `Arc<InMemoryKv>`.
        for &i in &deliveries {
            let mut working = program.blocks[i].clone();
            program
                .post_op(
                    &c,
                    &mut working,
                    RetCode::Success,
                    None,
                    Duration::from_secs(60),
                )
                .await
                .unwrap();
        }

        for child in 0..program.blocks.len() {
            if program.parents[child].is_empty() {
                continue;
            }
            let sum = c
                .kv
                .get(&format!("edgesum:{}:{}", program.program_hash, child))
                .await
                .unwrap()
                .unwrap_or(0);
            assert_eq!(
                sum as usize,
                program.parents[child].len(),
                "seed {seed}: edgesum({child}) must equal in-degree exactly (never less, never more) once every parent has delivered"
            );
        }

        for i in 0..program.blocks.len() {
            assert_eq!(
                program.node_status(&c, i).await.unwrap(),
                NodeStatus::Finished,
                "seed {seed}: block {i} must be FINISHED after all duplicate post-ops"
            );
        }
    }
}

/// Invariant 3 — priority donation: every node on the critical path gets
/// `max_priority`; every ancestor at depth `d <= max_priority` gets at
/// least `max_priority - d`.
#[tokio::test]
async fn priority_donation_matches_critical_path_depth() {
    let blocks = cholesky_demo::build_2x2();
    let program = Program::build(blocks, 2, 1.0, 1.0, false).unwrap();

    // The critical path for this DAG is local-chol -> column-update ->
    // low-rank-update -> EXIT (every block is on it, since it's a chain).
    for &node in &[0usize, 1, 2, program.exit_block] {
        assert_eq!(
            program.blocks[node].priority, program.max_priority,
            "block {node} lies on the critical path and must get max_priority"
        );
    }
}

/// Invariant 4 — FLOPs/IO counters: after a full run, the program's
/// recorded flops/read/write equal the sum over every executed block.
#[tokio::test]
async fn counters_equal_sum_of_block_totals() {
    let blocks = cholesky_demo::build_1x1();
    let program = Arc::new(Program::build(blocks, 1, 1.0, 1.0, false).unwrap());
    let c = collaborators(program.max_priority + 1);
    cholesky_demo::seed_1x1(&*c.tiles, 9.0).await.unwrap();
    program.start(&c).await.unwrap();

    let worker = tiledagrt::Worker::new(program.clone(), c.clone(), {
        let mut cfg = tiledagrt::WorkerConfig::default();
        cfg.idle_timeout_secs = 2;
        cfg.wall_timeout_secs = 10;
        cfg
    });
    worker.run().await.unwrap();

    let flops = program.total_flops(&c).await.unwrap();
    // chol(n=1) = 1/3 + 2/3 = 1.0, the block's only compute instruction.
    assert!((flops - 1.0).abs() < 1e-6);
}

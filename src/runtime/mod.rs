//! runtime — a serverless DAG execution runtime for dense linear algebra.
//!
//! A `Program` is a DAG of `InstructionBlock`s built from their read/write
//! tile dependencies. Workers pull ready blocks off per-priority queues,
//! execute them against pluggable collaborators (key-value store, queue,
//! object store, tile store, numeric kernels), and drive the node state
//! machine forward through `Program::post_op`.

pub mod block;
pub mod cache;
pub mod cholesky_demo;
pub mod config;
pub mod error;
pub mod executor;
pub mod instruction;
pub mod kernels;
pub mod kv;
pub mod node_state;
pub mod object_store;
pub mod program;
pub mod queue;
pub mod tile_store;
pub mod worker;

pub use block::InstructionBlock;
pub use config::WorkerConfig;
pub use error::{Result, RuntimeError};
pub use executor::Executor;
pub use instruction::{Instruction, Op, RetCode, Tile, TileRef};
pub use node_state::{EdgeStatus, NodeStatus, ProgramStatus};
pub use program::{Collaborators, Program};
pub use worker::Worker;

//! tiledagrt — serverless tile-DAG execution runtime for blocked dense
//! linear algebra.

pub mod runtime;

pub use runtime::{
    Collaborators, EdgeStatus, Executor, Instruction, InstructionBlock, NodeStatus, Op, Program,
    ProgramStatus, Result, RetCode, RuntimeError, Tile, TileRef, Worker, WorkerConfig,
};

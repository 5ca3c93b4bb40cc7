//! runtime/error.rs — error taxonomy for the tile-DAG runtime
//! Mirrors the five categories in the design: construction-time DAG
//! violations, CAS/atomic-primitive timeouts, transient I/O exhaustion,
//! same-process replay, and opaque kernel failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("tile {0:?} has {1} writers; single-assignment requires at most one")]
    NonSingleAssignment(crate::runtime::instruction::TileRef, usize),

    #[error("program construction error: {0}")]
    Construction(String),

    #[error("conditional increment on `{incr_key}` (cond `{cond_key}`) did not settle within {timeout_secs}s")]
    CasTimeout {
        incr_key: String,
        cond_key: String,
        timeout_secs: u64,
    },

    #[error("transient I/O exhausted after {attempts} attempts on tile {tile:?}: {source}")]
    TransientIo {
        tile: crate::runtime::instruction::TileRef,
        attempts: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("instruction {0} replayed in the same process")]
    ReplayDetected(u64),

    #[error("kernel failure in block {block}: {message}")]
    Kernel { block: usize, message: String },

    #[error("key-value store error: {0}")]
    Kv(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("object store error: {0}")]
    ObjectStore(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

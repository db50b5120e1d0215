use std::time::Duration;

use relay_types::pipeline::TensorDtype;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("rendezvous timed out after {waited:?}: {joined} of {expected} ranks joined")]
    RendezvousTimeout {
        waited: Duration,
        joined: u32,
        expected: u32,
    },

    #[error("{op} timed out after {after:?} waiting on rank {peer}")]
    CollectiveTimeout {
        op: &'static str,
        peer: u32,
        after: Duration,
    },

    #[error(
        "collective shape mismatch: buffer is {expected_dtype} {expected_shape:?}, \
         sender sent {got_dtype} {got_shape:?}"
    )]
    CollectiveShapeMismatch {
        expected_shape: Vec<usize>,
        expected_dtype: TensorDtype,
        got_shape: Vec<usize>,
        got_dtype: TensorDtype,
    },

    #[error("process group already initialized")]
    AlreadyInitialized,

    #[error("process group is not initialized")]
    NotInitialized,

    #[error("source rank {requested} out of range for world_size {world_size}")]
    InvalidSource { requested: u32, world_size: u32 },

    #[error("rank {0} left the process group")]
    PeerLeft(u32),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, NetError>;

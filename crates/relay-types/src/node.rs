// Rank topology for a fixed-size pipeline run.
use serde::Serialize;

use crate::error::{RelayError, Result};

/// Position of one process within the pipeline.
///
/// Invariant: `world_size >= 1` and `rank < world_size`. Fixed for the
/// lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RankTopology {
    rank: u32,
    world_size: u32,
}

impl RankTopology {
    pub fn new(rank: u32, world_size: u32) -> Result<Self> {
        if world_size == 0 {
            return Err(RelayError::Config("world_size must be at least 1".into()));
        }
        if rank >= world_size {
            return Err(RelayError::Config(format!(
                "rank {rank} out of range for world_size {world_size}"
            )));
        }
        Ok(Self { rank, world_size })
    }

    /// Single-process topology: rank 0 of 1.
    pub fn solo() -> Self {
        Self { rank: 0, world_size: 1 }
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    /// True for rank 0: consumes token ids and owns the input-side modules.
    pub fn is_first(&self) -> bool {
        self.rank == 0
    }

    /// True for the last rank: owns the output-side modules, produces logits.
    pub fn is_last(&self) -> bool {
        self.rank == self.world_size - 1
    }

    pub fn next_rank(&self) -> Option<u32> {
        (!self.is_last()).then_some(self.rank + 1)
    }

    pub fn prev_rank(&self) -> Option<u32> {
        self.rank.checked_sub(1)
    }
}

impl std::fmt::Display for RankTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rank {}/{}", self.rank, self.world_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_topologies() {
        assert!(RankTopology::new(0, 0).is_err());
        assert!(RankTopology::new(2, 2).is_err());
        assert!(RankTopology::new(1, 2).is_ok());
    }

    #[test]
    fn neighbours() {
        let mid = RankTopology::new(1, 3).unwrap();
        assert!(!mid.is_first());
        assert!(!mid.is_last());
        assert_eq!(mid.prev_rank(), Some(0));
        assert_eq!(mid.next_rank(), Some(2));

        let solo = RankTopology::solo();
        assert!(solo.is_first() && solo.is_last());
        assert_eq!(solo.next_rank(), None);
        assert_eq!(solo.prev_rank(), None);
    }
}

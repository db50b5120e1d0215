//! Even layer-to-rank assignment for pipeline parallelism.
//!
//! Algorithm:
//! 1. `base = total_layers / world_size`.
//! 2. Rank `i` gets `[i * base, (i + 1) * base)`.
//! 3. The last rank extends to `total_layers`, absorbing the remainder.
//! 4. First stage gets the input side, last stage gets the output side.

use relay_types::model::LayerRange;
use relay_types::node::RankTopology;
use relay_types::pipeline::{PipelinePlan, PipelineStage};

use crate::error::{PipelineError, Result};

/// Split `total_layers` into `world_size` contiguous half-open ranges.
///
/// Ranges may be empty when `total_layers < world_size`; every rank still
/// takes part in the pipeline, it just runs no layers.
pub fn partition(total_layers: u32, world_size: u32) -> Result<Vec<LayerRange>> {
    if world_size == 0 {
        return Err(PipelineError::Partition("world_size must be at least 1".into()));
    }

    let base = total_layers / world_size;
    let ranges: Vec<LayerRange> = (0..world_size)
        .map(|i| {
            let start = i * base;
            let end = if i == world_size - 1 { total_layers } else { (i + 1) * base };
            LayerRange::new(start, end)
        })
        .collect();

    check_coverage(&ranges, total_layers)?;
    Ok(ranges)
}

/// The range owned by one rank.
pub fn range_for(total_layers: u32, topology: RankTopology) -> Result<LayerRange> {
    let ranges = partition(total_layers, topology.world_size())?;
    ranges
        .get(topology.rank() as usize)
        .copied()
        .ok_or_else(|| PipelineError::Partition(format!("no range for {topology}")))
}

/// Ranges must tile `[0, total_layers)` in rank order with no gap or overlap.
pub fn check_coverage(ranges: &[LayerRange], total_layers: u32) -> Result<()> {
    let mut expected_start = 0u32;
    for (rank, range) in ranges.iter().enumerate() {
        if range.start != expected_start || range.end < range.start {
            return Err(PipelineError::Partition(format!(
                "rank {rank} range {range} breaks contiguity at layer {expected_start}"
            )));
        }
        expected_start = range.end;
    }
    if expected_start != total_layers {
        return Err(PipelineError::Partition(format!(
            "ranges cover {expected_start} layers, model has {total_layers}"
        )));
    }
    Ok(())
}

/// Full static plan for every rank, as reported by `relay-node plan`.
pub fn plan_stages(
    model_name: &str,
    total_layers: u32,
    hidden_size: usize,
    world_size: u32,
) -> Result<PipelinePlan> {
    let stages = partition(total_layers, world_size)?
        .into_iter()
        .enumerate()
        .map(|(i, layer_range)| {
            let rank = i as u32;
            PipelineStage {
                rank,
                layer_range,
                includes_embedding: rank == 0,
                includes_output_head: rank == world_size - 1,
            }
        })
        .collect();

    Ok(PipelinePlan {
        model_name: model_name.to_string(),
        total_layers,
        hidden_size,
        stages,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

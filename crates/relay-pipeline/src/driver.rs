//! Distributed forward pass.
//!
//! Every rank walks the same sequence of collectives: one broadcast per
//! hand-off (source = the rank handing off), then a closing barrier. Only
//! rank `s + 1` keeps what rank `s` broadcasts; the others discard it.

use candle_core::{Device, IndexOp, Tensor};
use tracing::{info, info_span, Instrument};

use relay_net::{GroupConfig, ProcessGroup};
use relay_types::model::ArchitectureManifest;
use relay_types::pipeline::{HostTensor, TensorDtype};

use crate::error::{PipelineError, Result};
use crate::executor::{PipelineTensor, StageExecutor};
use crate::model::LocalModel;
use crate::planner::range_for;
use crate::source::ModelSource;
use crate::tensor::{from_host, to_host, token_ids};

/// Run one forward pass of `request` through an initialized group.
///
/// Returns the logits on the last rank and `None` everywhere else. Every
/// rank must call this with a request of the same shape and the same
/// activation `dtype`.
pub async fn run_pipeline(
    group: &mut ProcessGroup,
    local: &LocalModel,
    manifest: &ArchitectureManifest,
    request: &[Vec<u32>],
    dtype: TensorDtype,
    device: &Device,
) -> Result<Option<Tensor>> {
    let topology = group.topology();
    let mut executor = StageExecutor::new(local, manifest, topology)?;

    let ids = token_ids(request, device)?;
    let (batch, seq_len) = ids.dims2()?;
    let hidden_shape = vec![batch, seq_len, local.hidden_size()];
    let last = topology.world_size() - 1;

    let mut incoming: Option<Tensor> = None;
    let mut logits = None;

    for stage in 0..=last {
        if stage == topology.rank() {
            let input = match incoming.take() {
                Some(hidden) => PipelineTensor::Hidden(hidden),
                None => PipelineTensor::TokenIds(ids.clone()),
            };
            match executor.forward(input)? {
                PipelineTensor::Logits(out) => logits = Some(out),
                PipelineTensor::Hidden(out) => {
                    let Some(next) = topology.next_rank() else {
                        return Err(PipelineError::Execution(format!(
                            "{topology} has no successor for its hidden state"
                        )));
                    };
                    let mut host = to_host(&out)?;
                    group.broadcast(&mut host, stage).await?;
                    executor.mark_sent()?;
                    info!(%topology, to = next, shape = ?host.shape, "hidden state handed off");
                }
                other => {
                    return Err(PipelineError::Execution(format!(
                        "stage produced {}",
                        other.kind()
                    )))
                }
            }
        } else if stage < last {
            let mut buffer = HostTensor::zeros(hidden_shape.clone(), dtype);
            group.broadcast(&mut buffer, stage).await?;
            if topology.prev_rank() == Some(stage) {
                incoming = Some(from_host(&buffer, device)?);
                executor.mark_received()?;
                info!(%topology, from = stage, "hidden state received");
            }
        }
    }

    group.barrier().await?;
    if !executor.is_done() {
        return Err(PipelineError::Execution(format!(
            "{topology} finished the pass in {}",
            executor.state()
        )));
    }
    Ok(logits)
}

/// One rank's whole run: join the group, load the shard, run the pass and
/// leave. The group is torn down whether or not the run succeeded.
pub async fn run_rank<S: ModelSource>(
    config: GroupConfig,
    source: &S,
    manifest: &ArchitectureManifest,
    request: &[Vec<u32>],
    dtype: TensorDtype,
    device: &Device,
) -> Result<Option<Tensor>> {
    let topology = config.topology;
    let mut group = ProcessGroup::new(config);

    let outcome = join_and_run(&mut group, source, manifest, request, dtype, device)
        .instrument(info_span!("rank", rank = topology.rank()))
        .await;

    group.teardown().await;
    outcome
}

async fn join_and_run<S: ModelSource>(
    group: &mut ProcessGroup,
    source: &S,
    manifest: &ArchitectureManifest,
    request: &[Vec<u32>],
    dtype: TensorDtype,
    device: &Device,
) -> Result<Option<Tensor>> {
    let topology = group.topology();
    group.initialize().await?;
    info!(run_id = group.run_id().unwrap_or_default(), "joined process group");

    let total_layers = manifest.layer_count(&source.config())?;
    let range = range_for(total_layers, topology)?;
    let local = source.load_local(manifest, topology, range)?;

    // Nobody starts the pass until every shard is loaded.
    group.barrier().await?;
    run_pipeline(group, &local, manifest, request, dtype, device).await
}

/// Most likely next token after the last position of the first sequence.
pub fn greedy_next_token(logits: &Tensor) -> Result<u32> {
    let (_batch, seq_len, _vocab) = logits.dims3()?;
    if seq_len == 0 {
        return Err(PipelineError::Execution("logits hold no positions".into()));
    }
    let last = logits.i((0, seq_len - 1))?;
    Ok(last.argmax(0)?.to_scalar::<u32>()?)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

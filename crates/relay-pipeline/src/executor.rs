//! Per-rank stage execution.
//!
//! [`StageExecutor`] runs one rank's part of a forward pass against its
//! [`LocalModel`] and walks the rank's [`StageProgress`]. It performs no
//! network I/O; the driver moves tensors between ranks and reports the
//! hand-offs back through [`StageExecutor::mark_received`] and
//! [`StageExecutor::mark_sent`].

use candle_core::Tensor;
use tracing::debug;

use relay_types::model::{ArchitectureManifest, ModuleRole};
use relay_types::node::RankTopology;

use crate::error::{PipelineError, Result};
use crate::model::{BoxedModule, LocalModel, Slot};
use crate::stage::{StageProgress, StageState};

/// What flows into and out of a stage.
#[derive(Debug, Clone)]
pub enum PipelineTensor {
    /// `[batch, seq]` u32 token ids; input to rank 0.
    TokenIds(Tensor),
    /// `[batch, seq, hidden]` activations between ranks.
    Hidden(Tensor),
    /// `[batch, seq, vocab]` scores produced by the last rank.
    Logits(Tensor),
}

impl PipelineTensor {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TokenIds(_) => "token ids",
            Self::Hidden(_)   => "hidden state",
            Self::Logits(_)   => "logits",
        }
    }

    pub fn tensor(&self) -> &Tensor {
        match self {
            Self::TokenIds(t) | Self::Hidden(t) | Self::Logits(t) => t,
        }
    }

    pub fn into_tensor(self) -> Tensor {
        match self {
            Self::TokenIds(t) | Self::Hidden(t) | Self::Logits(t) => t,
        }
    }
}

// ── Stage Executor ───────────────────────────────────────────────────────────

/// Runs one forward pass through one rank's shard.
pub struct StageExecutor<'a> {
    local: &'a LocalModel,
    manifest: &'a ArchitectureManifest,
    topology: RankTopology,
    progress: StageProgress,
}

impl<'a> StageExecutor<'a> {
    pub fn new(
        local: &'a LocalModel,
        manifest: &'a ArchitectureManifest,
        topology: RankTopology,
    ) -> Result<Self> {
        if local.topology() != topology {
            return Err(PipelineError::Execution(format!(
                "local model was built for {} but executor runs as {topology}",
                local.topology()
            )));
        }
        Ok(Self {
            local,
            manifest,
            topology,
            progress: StageProgress::new(topology),
        })
    }

    pub fn is_first_stage(&self) -> bool {
        self.topology.is_first()
    }

    pub fn is_last_stage(&self) -> bool {
        self.topology.is_last()
    }

    pub fn state(&self) -> StageState {
        self.progress.state()
    }

    pub fn is_done(&self) -> bool {
        self.progress.is_done()
    }

    /// The previous rank's hidden state has arrived.
    pub fn mark_received(&mut self) -> Result<()> {
        self.progress.advance(StageState::Layers)
    }

    /// The hidden state has been handed to the next rank.
    pub fn mark_sent(&mut self) -> Result<()> {
        self.progress.advance(StageState::Done)
    }

    /// Embed (rank 0), run the owned layers, then apply the output side
    /// (last rank). Returns `Logits` on the last rank and `Hidden` elsewhere.
    pub fn forward(&mut self, input: PipelineTensor) -> Result<PipelineTensor> {
        let mut hidden = match (self.state(), input) {
            (StageState::Embed, PipelineTensor::TokenIds(ids)) => {
                let hidden = self.embed(&ids)?;
                self.progress.advance(StageState::Layers)?;
                hidden
            }
            (StageState::Layers, PipelineTensor::Hidden(hidden)) => hidden,
            (state, input) => {
                return Err(PipelineError::Execution(format!(
                    "{} cannot accept {} while in {state}",
                    self.topology,
                    input.kind()
                )))
            }
        };

        for layer in self.local.layers() {
            hidden = layer.forward(&hidden)?;
        }
        debug!(
            topology = %self.topology,
            range = %self.local.range(),
            shape = ?hidden.dims(),
            "layers applied"
        );

        if self.is_last_stage() {
            self.progress.advance(StageState::Head)?;
            let logits = self.head(&hidden)?;
            self.progress.advance(StageState::Done)?;
            Ok(PipelineTensor::Logits(logits))
        } else {
            self.progress.advance(StageState::Send)?;
            Ok(PipelineTensor::Hidden(hidden))
        }
    }

    fn embed(&self, ids: &Tensor) -> Result<Tensor> {
        let token_embedding = owned(&self.local.token_embedding, ModuleRole::TokenEmbedding)?;
        let positional_embedding =
            owned(&self.local.positional_embedding, ModuleRole::PositionalEmbedding)?;
        let mut hidden = embed(
            token_embedding,
            positional_embedding,
            ids,
            self.manifest.positional_index_offset,
        )?;
        if let Some(slot) = &self.local.input_projection {
            hidden = owned(slot, ModuleRole::InputProjection)?.forward(&hidden)?;
        }
        Ok(hidden)
    }

    fn head(&self, hidden: &Tensor) -> Result<Tensor> {
        let mut hidden = hidden.clone();
        if let Some(slot) = &self.local.output_projection {
            hidden = owned(slot, ModuleRole::OutputProjection)?.forward(&hidden)?;
        }
        hidden = owned(&self.local.final_norm, ModuleRole::FinalNorm)?.forward(&hidden)?;
        Ok(owned(&self.local.output_head, ModuleRole::OutputHead)?.forward(&hidden)?)
    }
}

/// Run one rank's stage on an input that is already local.
///
/// Rank 0 expects token ids, every other rank a hidden state. The last rank
/// returns logits; every other rank returns the hidden state to forward.
pub fn run_local_stage(
    local: &LocalModel,
    input: PipelineTensor,
    topology: RankTopology,
    manifest: &ArchitectureManifest,
) -> Result<PipelineTensor> {
    let mut executor = StageExecutor::new(local, manifest, topology)?;
    if !executor.is_first_stage() {
        executor.mark_received()?;
    }
    executor.forward(input)
}

/// Token plus positional embedding of `[b, s]` ids.
///
/// Positions are `offset..offset + s`, shared by every row of the batch.
pub(crate) fn embed(
    token_embedding: &BoxedModule,
    positional_embedding: &BoxedModule,
    ids: &Tensor,
    offset: u32,
) -> Result<Tensor> {
    let (_batch, seq_len) = ids.dims2()?;
    let positions = Tensor::arange(offset, offset + seq_len as u32, ids.device())?;
    let tokens = token_embedding.forward(ids)?;
    let positions = positional_embedding.forward(&positions)?;
    Ok(tokens.broadcast_add(&positions)?)
}

fn owned(slot: &Slot<BoxedModule>, role: ModuleRole) -> Result<&BoxedModule> {
    slot.owned()
        .ok_or_else(|| PipelineError::Execution(format!("{role} is not owned by this rank")))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_local_model;
    use crate::planner::partition;
    use crate::source::{ModelSource, SyntheticFamily, SyntheticModel};
    use candle_core::Device;

    const TOKENS: [[u32; 3]; 1] = [[5, 9, 2]];

    fn source(family: SyntheticFamily, layers: u32) -> SyntheticModel {
        SyntheticModel::new(family, layers, 8, 16, 32, 11, Device::Cpu)
    }

    fn manifest(family: SyntheticFamily) -> ArchitectureManifest {
        match family {
            SyntheticFamily::Gpt2 => ArchitectureManifest::gpt2(),
            SyntheticFamily::Opt => ArchitectureManifest::opt(),
        }
    }

    fn shards(family: SyntheticFamily, layers: u32, ws: u32) -> Vec<LocalModel> {
        let ranges = partition(layers, ws).unwrap();
        (0..ws)
            .map(|rank| {
                let topo = RankTopology::new(rank, ws).unwrap();
                build_local_model(
                    source(family, layers).load().unwrap(),
                    &manifest(family),
                    topo,
                    ranges[rank as usize],
                )
                .unwrap()
            })
            .collect()
    }

    /// Chain every rank's stage in-process, as the driver would over the network.
    fn chained(family: SyntheticFamily, layers: u32, ws: u32, ids: &Tensor) -> Tensor {
        let m = manifest(family);
        let mut value = PipelineTensor::TokenIds(ids.clone());
        for local in shards(family, layers, ws) {
            value = run_local_stage(&local, value, local.topology(), &m).unwrap();
        }
        match value {
            PipelineTensor::Logits(t) => t,
            other => panic!("pipeline ended with {}", other.kind()),
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap()
    }

    #[test]
    fn single_rank_matches_reference() {
        for family in [SyntheticFamily::Gpt2, SyntheticFamily::Opt] {
            let ids = Tensor::new(&TOKENS, &Device::Cpu).unwrap();
            let reference = source(family, 4)
                .load()
                .unwrap()
                .forward_reference(&manifest(family), &ids)
                .unwrap();
            let logits = chained(family, 4, 1, &ids);
            assert_eq!(logits.dims(), &[1, 3, 16]);
            assert_eq!(max_abs_diff(&logits, &reference), 0.0);
        }
    }

    #[test]
    fn split_pipeline_matches_reference() {
        for family in [SyntheticFamily::Gpt2, SyntheticFamily::Opt] {
            let ids = Tensor::new(&[[1u32, 2, 3, 4], [4, 3, 2, 1]], &Device::Cpu).unwrap();
            let reference = source(family, 5)
                .load()
                .unwrap()
                .forward_reference(&manifest(family), &ids)
                .unwrap();
            for ws in [2, 3, 7] {
                let logits = chained(family, 5, ws, &ids);
                assert_eq!(logits.dims(), &[2, 4, 16]);
                assert!(max_abs_diff(&logits, &reference) < 1e-5, "{family:?} over {ws} ranks");
            }
        }
    }

    #[test]
    fn first_rank_emits_hidden_state() {
        let locals = shards(SyntheticFamily::Gpt2, 4, 2);
        let ids = Tensor::new(&TOKENS, &Device::Cpu).unwrap();
        let out = run_local_stage(
            &locals[0],
            PipelineTensor::TokenIds(ids),
            locals[0].topology(),
            &ArchitectureManifest::gpt2(),
        )
        .unwrap();
        assert!(matches!(out, PipelineTensor::Hidden(_)));
        assert_eq!(out.tensor().dims(), &[1, 3, 8]);
    }

    #[test]
    fn empty_stack_is_identity() {
        // 1 layer over 3 ranks leaves ranks 0 and 1 without layers.
        let locals = shards(SyntheticFamily::Gpt2, 1, 3);
        assert_eq!(locals[1].layer_count(), 0);
        let hidden = Tensor::randn(0f32, 1.0, (1, 3, 8), &Device::Cpu).unwrap();
        let out = run_local_stage(
            &locals[1],
            PipelineTensor::Hidden(hidden.clone()),
            locals[1].topology(),
            &ArchitectureManifest::gpt2(),
        )
        .unwrap();
        assert_eq!(max_abs_diff(out.tensor(), &hidden), 0.0);
    }

    #[test]
    fn wrong_input_kind_is_rejected() {
        let locals = shards(SyntheticFamily::Gpt2, 4, 2);
        let m = ArchitectureManifest::gpt2();
        let logits = Tensor::zeros((1, 3, 16), candle_core::DType::F32, &Device::Cpu).unwrap();
        let err = run_local_stage(&locals[1], PipelineTensor::Logits(logits), locals[1].topology(), &m)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Execution(_)));

        let ids = Tensor::new(&TOKENS, &Device::Cpu).unwrap();
        assert!(run_local_stage(&locals[1], PipelineTensor::TokenIds(ids), locals[1].topology(), &m).is_err());
    }

    #[test]
    fn topology_must_match_shard() {
        let locals = shards(SyntheticFamily::Gpt2, 4, 2);
        let m = ArchitectureManifest::gpt2();
        assert!(StageExecutor::new(&locals[0], &m, RankTopology::new(1, 2).unwrap()).is_err());
    }

    #[test]
    fn executor_walks_its_states() {
        let locals = shards(SyntheticFamily::Gpt2, 4, 2);
        let m = ArchitectureManifest::gpt2();
        let mut exec = StageExecutor::new(&locals[1], &m, locals[1].topology()).unwrap();
        assert_eq!(exec.state(), StageState::Receive);
        let hidden = Tensor::zeros((1, 3, 8), candle_core::DType::F32, &Device::Cpu).unwrap();
        // Forward before the hand-off arrived is out of order.
        assert!(exec.forward(PipelineTensor::Hidden(hidden.clone())).is_err());
        exec.mark_received().unwrap();
        exec.forward(PipelineTensor::Hidden(hidden)).unwrap();
        assert!(exec.is_done());
        assert!(exec.mark_sent().is_err());
    }
}

//! Model sources.
//!
//! A [`ModelSource`] yields a configuration object and a module tree. The
//! builder only needs the tree to be addressable by the manifest's locators,
//! so any source that lays its modules out the way its family's manifest
//! expects can feed the pipeline.
//!
//! [`SyntheticModel`] generates GPT-2 or OPT shaped models from a seed. Every
//! parameter has its own seed, so a rank that materialises only its shard
//! gets bit-identical weights to a rank that materialises everything.

use std::collections::BTreeSet;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, LayerNorm, Linear};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use tracing::info;

use relay_types::config::{ModelConfig, ModelSourceConfig};
use relay_types::model::{ArchitectureManifest, LayerRange, ModuleRole};
use relay_types::node::RankTopology;
use relay_types::RelayError;

use crate::builder::build_local_model;
use crate::error::{PipelineError, Result};
use crate::model::{LocalModel, ModelInstance, ModuleNode};
use crate::tensor::{candle_dtype, parse_device};

const LAYER_NORM_EPS: f64 = 1e-5;

// ── Model Source ──────────────────────────────────────────────────────────────

pub trait ModelSource {
    /// The model's configuration object, as read by manifest locators.
    fn config(&self) -> Value;

    /// Materialise the full model.
    fn load(&self) -> Result<ModelInstance>;

    /// Materialise only what `topology` runs over `range`.
    ///
    /// The default loads everything and prunes; sources that can skip
    /// unneeded weights override it.
    fn load_local(
        &self,
        manifest: &ArchitectureManifest,
        topology: RankTopology,
        range: LayerRange,
    ) -> Result<LocalModel> {
        build_local_model(self.load()?, manifest, topology, range)
    }
}

// ── Synthetic Model ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticFamily {
    /// Embeddings, blocks and head all at the hidden width.
    Gpt2,
    /// Embeddings and head at half the hidden width, with projections in and
    /// out of the stack and positions offset by 2.
    Opt,
}

impl SyntheticFamily {
    pub fn from_architecture(name: &str) -> Result<Self> {
        match name {
            "gpt2" => Ok(Self::Gpt2),
            "opt" => Ok(Self::Opt),
            other => Err(RelayError::Config(format!(
                "no synthetic family for architecture `{other}`"
            ))
            .into()),
        }
    }

    pub fn manifest(&self) -> ArchitectureManifest {
        match self {
            Self::Gpt2 => ArchitectureManifest::gpt2(),
            Self::Opt => ArchitectureManifest::opt(),
        }
    }
}

/// Pre-norm residual MLP block: `x + down(gelu(up(norm(x))))`.
pub struct ResidualMlp {
    norm: LayerNorm,
    up: Linear,
    down: Linear,
}

impl Module for ResidualMlp {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.up.forward(&self.norm.forward(xs)?)?.gelu()?;
        xs.add(&self.down.forward(&h)?)
    }
}

/// One generated parameter group, used to decide what to materialise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Piece {
    Boundary(Role),
    Layer(u32),
}

/// `ModuleRole` is not `Ord`; boundary pieces are keyed by this mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Role {
    TokenEmbedding,
    PositionalEmbedding,
    InputProjection,
    OutputProjection,
    FinalNorm,
    OutputHead,
}

impl Role {
    fn of(role: ModuleRole) -> Option<Self> {
        match role {
            ModuleRole::TokenEmbedding      => Some(Self::TokenEmbedding),
            ModuleRole::PositionalEmbedding => Some(Self::PositionalEmbedding),
            ModuleRole::InputProjection     => Some(Self::InputProjection),
            ModuleRole::OutputProjection    => Some(Self::OutputProjection),
            ModuleRole::FinalNorm           => Some(Self::FinalNorm),
            ModuleRole::OutputHead          => Some(Self::OutputHead),
            ModuleRole::LayerStack          => None,
        }
    }

    /// Seed stream for this module's parameters.
    fn stream(&self) -> u64 {
        *self as u64 + 1
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticModel {
    family: SyntheticFamily,
    num_layers: u32,
    hidden_size: usize,
    vocab_size: usize,
    max_positions: usize,
    seed: u64,
    dtype: DType,
    device: Device,
    memory_budget_bytes: Option<u64>,
}

impl SyntheticModel {
    pub fn new(
        family: SyntheticFamily,
        num_layers: u32,
        hidden_size: usize,
        vocab_size: usize,
        max_positions: usize,
        seed: u64,
        device: Device,
    ) -> Self {
        Self {
            family,
            num_layers,
            hidden_size,
            vocab_size,
            max_positions,
            seed,
            dtype: DType::F32,
            device,
            memory_budget_bytes: None,
        }
    }

    /// Build from the `model` section of a cluster configuration.
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let family = SyntheticFamily::from_architecture(&config.architecture)?;
        let device = parse_device(&config.device)?;
        let ModelSourceConfig::Synthetic {
            num_layers,
            hidden_size,
            vocab_size,
            max_positions,
            seed,
        } = config.source.clone();
        if family == SyntheticFamily::Opt && hidden_size < 2 {
            return Err(RelayError::Config("opt models need hidden_size >= 2".into()).into());
        }
        let mut model = Self::new(family, num_layers, hidden_size, vocab_size, max_positions, seed, device)
            .with_dtype(candle_dtype(config.dtype));
        model.memory_budget_bytes = config.memory_budget_bytes;
        Ok(model)
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget_bytes = Some(bytes);
        self
    }

    pub fn family(&self) -> SyntheticFamily {
        self.family
    }

    /// Width of the embeddings and head.
    fn embed_dim(&self) -> usize {
        match self.family {
            SyntheticFamily::Gpt2 => self.hidden_size,
            SyntheticFamily::Opt => (self.hidden_size / 2).max(1),
        }
    }

    fn position_rows(&self) -> usize {
        self.max_positions + self.family.manifest().positional_index_offset as usize
    }

    // ── Parameter accounting ──────────────────────────────────────────────

    fn pieces(&self) -> BTreeSet<Piece> {
        let manifest = self.family.manifest();
        ModuleRole::ALL
            .into_iter()
            .filter(|role| manifest.locator(*role).is_some())
            .filter_map(Role::of)
            .map(Piece::Boundary)
            .chain((0..self.num_layers).map(Piece::Layer))
            .collect()
    }

    fn element_count(&self, piece: Piece) -> usize {
        let (h, e) = (self.hidden_size, self.embed_dim());
        match piece {
            Piece::Boundary(Role::TokenEmbedding) => self.vocab_size * e,
            Piece::Boundary(Role::PositionalEmbedding) => self.position_rows() * e,
            Piece::Boundary(Role::InputProjection) => e * h + h,
            Piece::Boundary(Role::OutputProjection) => h * e + e,
            Piece::Boundary(Role::FinalNorm) => 2 * e,
            Piece::Boundary(Role::OutputHead) => self.vocab_size * e,
            // norm + up (h -> 4h) + down (4h -> h)
            Piece::Layer(_) => 2 * h + (4 * h * h + 4 * h) + (4 * h * h + h),
        }
    }

    fn check_budget(&self, pieces: &BTreeSet<Piece>) -> Result<()> {
        let Some(budget) = self.memory_budget_bytes else {
            return Ok(());
        };
        let elements: usize = pieces.iter().map(|p| self.element_count(*p)).sum();
        let bytes = (elements * self.dtype.size_in_bytes()) as u64;
        if bytes > budget {
            return Err(PipelineError::ResourceExhaustion(format!(
                "materialising {} modules needs {bytes} bytes, budget is {budget}",
                pieces.len()
            )));
        }
        Ok(())
    }

    // ── Generation ────────────────────────────────────────────────────────

    fn uniform(&self, stream: u64, rows: usize, cols: usize) -> Result<Tensor> {
        let mut rng = StdRng::seed_from_u64(self.seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let bound = 1.0 / (cols as f32).sqrt();
        let values: Vec<f32> = (0..rows * cols).map(|_| rng.gen_range(-bound..bound)).collect();
        Ok(Tensor::from_vec(values, (rows, cols), &self.device)?.to_dtype(self.dtype)?)
    }

    fn zeros(&self, len: usize) -> Result<Tensor> {
        Ok(Tensor::zeros(len, self.dtype, &self.device)?)
    }

    fn layer_norm(&self, width: usize) -> Result<LayerNorm> {
        let weight = Tensor::ones(width, self.dtype, &self.device)?;
        Ok(LayerNorm::new(weight, self.zeros(width)?, LAYER_NORM_EPS))
    }

    fn linear(&self, stream: u64, input: usize, output: usize, bias: bool) -> Result<Linear> {
        let weight = self.uniform(stream, output, input)?;
        let bias = if bias { Some(self.zeros(output)?) } else { None };
        Ok(Linear::new(weight, bias))
    }

    fn embedding(&self, stream: u64, rows: usize, width: usize) -> Result<Embedding> {
        Ok(Embedding::new(self.uniform(stream, rows, width)?, width))
    }

    fn block(&self, index: u32) -> Result<ResidualMlp> {
        let h = self.hidden_size;
        let stream = 1_000 + u64::from(index) * 2;
        Ok(ResidualMlp {
            norm: self.layer_norm(h)?,
            up: self.linear(stream, h, 4 * h, true)?,
            down: self.linear(stream + 1, 4 * h, h, true)?,
        })
    }

    fn boundary(&self, role: Role) -> Result<ModuleNode> {
        let (h, e) = (self.hidden_size, self.embed_dim());
        let s = role.stream();
        Ok(match role {
            Role::TokenEmbedding => ModuleNode::leaf(self.embedding(s, self.vocab_size, e)?),
            Role::PositionalEmbedding => ModuleNode::leaf(self.embedding(s, self.position_rows(), e)?),
            Role::InputProjection => ModuleNode::leaf(self.linear(s, e, h, true)?),
            Role::OutputProjection => ModuleNode::leaf(self.linear(s, h, e, true)?),
            Role::FinalNorm => ModuleNode::leaf(self.layer_norm(e)?),
            Role::OutputHead => ModuleNode::leaf(self.linear(s, e, self.vocab_size, false)?),
        })
    }

    /// Build the tree, materialising only `keep`.
    fn materialise(&self, keep: &BTreeSet<Piece>) -> Result<ModelInstance> {
        self.check_budget(keep)?;

        let node = |role: Role| -> Result<ModuleNode> {
            if keep.contains(&Piece::Boundary(role)) {
                self.boundary(role)
            } else {
                Ok(ModuleNode::Pruned)
            }
        };
        let layers = (0..self.num_layers)
            .map(|i| {
                if keep.contains(&Piece::Layer(i)) {
                    Ok(ModuleNode::leaf(self.block(i)?))
                } else {
                    Ok(ModuleNode::Pruned)
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let root = match self.family {
            SyntheticFamily::Gpt2 => ModuleNode::named([
                (
                    "transformer",
                    ModuleNode::named([
                        ("wte", node(Role::TokenEmbedding)?),
                        ("wpe", node(Role::PositionalEmbedding)?),
                        ("h", ModuleNode::List(layers)),
                        ("ln_f", node(Role::FinalNorm)?),
                    ]),
                ),
                ("lm_head", node(Role::OutputHead)?),
            ]),
            SyntheticFamily::Opt => ModuleNode::named([
                (
                    "model",
                    ModuleNode::named([(
                        "decoder",
                        ModuleNode::named([
                            ("embed_tokens", node(Role::TokenEmbedding)?),
                            ("embed_positions", node(Role::PositionalEmbedding)?),
                            ("project_in", node(Role::InputProjection)?),
                            ("layers", ModuleNode::List(layers)),
                            ("project_out", node(Role::OutputProjection)?),
                            ("final_layer_norm", node(Role::FinalNorm)?),
                        ]),
                    )]),
                ),
                ("lm_head", node(Role::OutputHead)?),
            ]),
        };

        info!(
            family = ?self.family,
            layers = self.num_layers,
            materialised = keep.len(),
            "synthetic model generated"
        );
        Ok(ModelInstance::new(self.model_type(), self.config(), root))
    }

    fn model_type(&self) -> &'static str {
        match self.family {
            SyntheticFamily::Gpt2 => "gpt2",
            SyntheticFamily::Opt => "opt",
        }
    }
}

impl ModelSource for SyntheticModel {
    fn config(&self) -> Value {
        match self.family {
            SyntheticFamily::Gpt2 => json!({
                "model_type": "gpt2",
                "n_layer": self.num_layers,
                "n_embd": self.hidden_size,
                "vocab_size": self.vocab_size,
                "n_positions": self.max_positions,
            }),
            SyntheticFamily::Opt => json!({
                "model_type": "opt",
                "num_hidden_layers": self.num_layers,
                "hidden_size": self.hidden_size,
                "word_embed_proj_dim": self.embed_dim(),
                "vocab_size": self.vocab_size,
                "max_position_embeddings": self.max_positions,
            }),
        }
    }

    fn load(&self) -> Result<ModelInstance> {
        self.materialise(&self.pieces())
    }

    fn load_local(
        &self,
        manifest: &ArchitectureManifest,
        topology: RankTopology,
        range: LayerRange,
    ) -> Result<LocalModel> {
        let keep: BTreeSet<Piece> = self
            .pieces()
            .into_iter()
            .filter(|piece| match piece {
                Piece::Layer(i) => range.contains(*i),
                Piece::Boundary(role) => match role {
                    Role::TokenEmbedding | Role::PositionalEmbedding | Role::InputProjection => {
                        topology.is_first()
                    }
                    Role::OutputProjection | Role::FinalNorm | Role::OutputHead => topology.is_last(),
                },
            })
            .collect();
        build_local_model(self.materialise(&keep)?, manifest, topology, range)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{run_local_stage, PipelineTensor};
    use relay_types::pipeline::TensorDtype;

    fn gpt2(layers: u32) -> SyntheticModel {
        SyntheticModel::new(SyntheticFamily::Gpt2, layers, 8, 16, 32, 5, Device::Cpu)
    }

    #[test]
    fn generation_is_deterministic() {
        let ids = Tensor::new(&[[3u32, 1, 4]], &Device::Cpu).unwrap();
        let manifest = ArchitectureManifest::gpt2();
        let a = gpt2(2).load().unwrap().forward_reference(&manifest, &ids).unwrap();
        let b = gpt2(2).load().unwrap().forward_reference(&manifest, &ids).unwrap();
        assert_eq!(a.to_vec3::<f32>().unwrap(), b.to_vec3::<f32>().unwrap());
    }

    #[test]
    fn config_matches_builtin_manifests() {
        let cfg = gpt2(3).config();
        let manifest = ArchitectureManifest::gpt2();
        assert_eq!(manifest.layer_count(&cfg).unwrap(), 3);
        assert_eq!(manifest.hidden_size(&cfg).unwrap(), 8);

        let opt = SyntheticModel::new(SyntheticFamily::Opt, 2, 8, 16, 32, 5, Device::Cpu);
        let layout = opt.load().unwrap().validate(&ArchitectureManifest::opt()).unwrap();
        assert_eq!(layout.total_layers, 2);
        assert_eq!(opt.config()["word_embed_proj_dim"], 4);
    }

    #[test]
    fn partial_load_matches_full_load() {
        let source = gpt2(4);
        let manifest = ArchitectureManifest::gpt2();
        let topology = RankTopology::new(1, 2).unwrap();
        let range = LayerRange::new(2, 4);

        let partial = source.load_local(&manifest, topology, range).unwrap();
        let full = build_local_model(source.load().unwrap(), &manifest, topology, range).unwrap();
        assert_eq!(partial.owned_roles(), full.owned_roles());

        let hidden = Tensor::randn(0f32, 1.0, (1, 3, 8), &Device::Cpu).unwrap();
        let run = |local: &LocalModel| {
            run_local_stage(local, PipelineTensor::Hidden(hidden.clone()), topology, &manifest)
                .unwrap()
                .into_tensor()
                .to_vec3::<f32>()
                .unwrap()
        };
        assert_eq!(run(&partial), run(&full));
    }

    #[test]
    fn middle_rank_materialises_only_its_layers() {
        let source = gpt2(6);
        let keep: BTreeSet<Piece> = [Piece::Layer(2), Piece::Layer(3)].into_iter().collect();
        let model = source.materialise(&keep).unwrap();
        assert_eq!(model.root.leaf_count(), 2);
    }

    #[test]
    fn memory_budget_is_enforced() {
        let source = gpt2(4).with_memory_budget(1_024);
        assert!(matches!(source.load(), Err(PipelineError::ResourceExhaustion(_))));

        // A generous budget admits the same model.
        assert!(gpt2(4).with_memory_budget(1 << 30).load().is_ok());
    }

    #[test]
    fn budget_too_small_for_the_model_fits_a_middle_shard() {
        // f32 bytes: each layer 2272, boundary modules 2112, full model 15744.
        let source = gpt2(6).with_memory_budget(5_000);
        let manifest = ArchitectureManifest::gpt2();
        assert!(matches!(source.load(), Err(PipelineError::ResourceExhaustion(_))));

        let middle = source
            .load_local(&manifest, RankTopology::new(1, 3).unwrap(), LayerRange::new(2, 4))
            .unwrap();
        assert_eq!(middle.layer_count(), 2);
        assert!(middle.owned_roles().is_empty());

        // Rank 0 also holds the embeddings (6080 bytes) and goes over.
        let first = source.load_local(&manifest, RankTopology::new(0, 3).unwrap(), LayerRange::new(0, 2));
        assert!(matches!(first, Err(PipelineError::ResourceExhaustion(_))));
    }

    #[test]
    fn from_config_applies_dtype_and_family() {
        let config = ModelConfig {
            architecture: "opt".into(),
            dtype: TensorDtype::F16,
            ..ModelConfig::default()
        };
        let source = SyntheticModel::from_config(&config).unwrap();
        assert_eq!(source.family(), SyntheticFamily::Opt);
        assert_eq!(source.dtype, DType::F16);

        let bad = ModelConfig { architecture: "bloom".into(), ..ModelConfig::default() };
        assert!(SyntheticModel::from_config(&bad).is_err());
    }
}

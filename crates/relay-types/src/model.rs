// Model-structure types shared by the partitioner, shard builder and executor.
//
// A model is described by an `ArchitectureManifest`: where each role-specific
// module lives inside the model tree and where the layer count / hidden size
// live inside the model's JSON config.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RelayError, Result};

// ── Layer Range ───────────────────────────────────────────────────────────────

/// Half-open range `[start, end)` of layer-stack indices owned by one rank.
///
/// `LayerRange { start: 0, end: 4 }` covers layers 0, 1, 2, 3. An empty range
/// (`start == end`) is legal and means the rank owns no layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerRange {
    pub start: u32,
    pub end: u32,
}

impl LayerRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, layer: u32) -> bool {
        self.start <= layer && layer < self.end
    }
}

impl fmt::Display for LayerRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ── Locator ───────────────────────────────────────────────────────────────────

/// One step of a structural path: a named field or a list index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocatorStep {
    Field(String),
    Index(usize),
}

impl fmt::Display for LocatorStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => write!(f, "{name}"),
            Self::Index(i)    => write!(f, "{i}"),
        }
    }
}

/// Structural path into a model tree or config, written `transformer.h` or
/// `model.decoder.layers.0`. Purely numeric segments are list indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Locator {
    steps: Vec<LocatorStep>,
}

impl Locator {
    /// Build a locator from field names only.
    pub fn fields(names: &[&str]) -> Self {
        Self {
            steps: names
                .iter()
                .map(|n| LocatorStep::Field((*n).to_string()))
                .collect(),
        }
    }

    pub fn steps(&self) -> &[LocatorStep] {
        &self.steps
    }

    /// Resolve this locator against a JSON model config.
    pub fn resolve_value<'a>(&self, config: &'a Value) -> Result<&'a Value> {
        let mut node = config;
        for step in &self.steps {
            let next = match step {
                LocatorStep::Field(name) => node.get(name.as_str()),
                LocatorStep::Index(i)    => node.get(*i),
            };
            node = next.ok_or_else(|| {
                RelayError::Locator(format!("`{self}` does not resolve at step `{step}`"))
            })?;
        }
        Ok(node)
    }

    /// Resolve to a non-negative integer config value.
    pub fn resolve_u64(&self, config: &Value) -> Result<u64> {
        self.resolve_value(config)?.as_u64().ok_or_else(|| {
            RelayError::Locator(format!("`{self}` is not a non-negative integer"))
        })
    }
}

impl FromStr for Locator {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(RelayError::Locator("empty locator".into()));
        }
        let steps = s
            .split('.')
            .map(|seg| {
                if seg.is_empty() {
                    Err(RelayError::Locator(format!("empty segment in `{s}`")))
                } else if let Ok(i) = seg.parse::<usize>() {
                    Ok(LocatorStep::Index(i))
                } else {
                    Ok(LocatorStep::Field(seg.to_string()))
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { steps })
    }
}

impl TryFrom<String> for Locator {
    type Error = RelayError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Locator> for String {
    fn from(l: Locator) -> Self {
        l.to_string()
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{step}")?;
        }
        Ok(())
    }
}

// ── Module Roles ──────────────────────────────────────────────────────────────

/// Which end of the pipeline a module belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Owned by rank 0.
    Input,
    /// Sliced across all ranks.
    Stack,
    /// Owned by the last rank.
    Output,
}

/// Closed set of module roles a manifest can locate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleRole {
    TokenEmbedding,
    PositionalEmbedding,
    InputProjection,
    LayerStack,
    OutputProjection,
    FinalNorm,
    OutputHead,
}

impl ModuleRole {
    pub const ALL: [ModuleRole; 7] = [
        Self::TokenEmbedding,
        Self::PositionalEmbedding,
        Self::InputProjection,
        Self::LayerStack,
        Self::OutputProjection,
        Self::FinalNorm,
        Self::OutputHead,
    ];

    pub fn side(&self) -> Side {
        match self {
            Self::TokenEmbedding | Self::PositionalEmbedding | Self::InputProjection => Side::Input,
            Self::LayerStack => Side::Stack,
            Self::OutputProjection | Self::FinalNorm | Self::OutputHead => Side::Output,
        }
    }

    /// Optional roles may be absent from a manifest.
    pub fn is_required(&self) -> bool {
        !matches!(self, Self::InputProjection | Self::OutputProjection)
    }
}

impl fmt::Display for ModuleRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TokenEmbedding      => "token_embedding",
            Self::PositionalEmbedding => "positional_embedding",
            Self::InputProjection     => "input_projection",
            Self::LayerStack          => "layers",
            Self::OutputProjection    => "output_projection",
            Self::FinalNorm           => "final_norm",
            Self::OutputHead          => "output_head",
        };
        f.write_str(name)
    }
}

// ── Architecture Manifest ─────────────────────────────────────────────────────

/// Static, model-family-specific description of where the boundary modules
/// and the layer stack live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitectureManifest {
    /// Config value holding the number of layers.
    pub layer_count_locator: Locator,
    /// Config value holding the hidden size of inter-stage tensors.
    pub hidden_size_locator: Locator,
    pub layers_locator: Locator,
    pub embedding_locator: Locator,
    pub positional_embedding_locator: Locator,
    pub final_norm_locator: Locator,
    pub output_head_locator: Locator,
    #[serde(default)]
    pub input_projection_locator: Option<Locator>,
    #[serde(default)]
    pub output_projection_locator: Option<Locator>,
    /// Added to every position index before the positional lookup.
    #[serde(default)]
    pub positional_index_offset: u32,
}

/// Names accepted by [`ArchitectureManifest::builtin`].
pub const BUILTIN_ARCHITECTURES: &[&str] = &["gpt2", "opt"];

impl ArchitectureManifest {
    /// GPT-2 family layout.
    pub fn gpt2() -> Self {
        Self {
            layer_count_locator: Locator::fields(&["n_layer"]),
            hidden_size_locator: Locator::fields(&["n_embd"]),
            layers_locator: Locator::fields(&["transformer", "h"]),
            embedding_locator: Locator::fields(&["transformer", "wte"]),
            positional_embedding_locator: Locator::fields(&["transformer", "wpe"]),
            final_norm_locator: Locator::fields(&["transformer", "ln_f"]),
            output_head_locator: Locator::fields(&["lm_head"]),
            input_projection_locator: None,
            output_projection_locator: None,
            positional_index_offset: 0,
        }
    }

    /// OPT family layout: learned positions start at index 2 and the decoder
    /// projects between the embedding width and the hidden width.
    pub fn opt() -> Self {
        Self {
            layer_count_locator: Locator::fields(&["num_hidden_layers"]),
            hidden_size_locator: Locator::fields(&["hidden_size"]),
            layers_locator: Locator::fields(&["model", "decoder", "layers"]),
            embedding_locator: Locator::fields(&["model", "decoder", "embed_tokens"]),
            positional_embedding_locator: Locator::fields(&["model", "decoder", "embed_positions"]),
            final_norm_locator: Locator::fields(&["model", "decoder", "final_layer_norm"]),
            output_head_locator: Locator::fields(&["lm_head"]),
            input_projection_locator: Some(Locator::fields(&["model", "decoder", "project_in"])),
            output_projection_locator: Some(Locator::fields(&["model", "decoder", "project_out"])),
            positional_index_offset: 2,
        }
    }

    /// Look up a built-in manifest by architecture name.
    pub fn builtin(name: &str) -> Result<Self> {
        match name {
            "gpt2" => Ok(Self::gpt2()),
            "opt"  => Ok(Self::opt()),
            other  => Err(RelayError::Config(format!(
                "unknown architecture `{other}` (known: {})",
                BUILTIN_ARCHITECTURES.join(", ")
            ))),
        }
    }

    /// Locator for a role, `None` when an optional role is absent.
    pub fn locator(&self, role: ModuleRole) -> Option<&Locator> {
        match role {
            ModuleRole::TokenEmbedding      => Some(&self.embedding_locator),
            ModuleRole::PositionalEmbedding => Some(&self.positional_embedding_locator),
            ModuleRole::InputProjection     => self.input_projection_locator.as_ref(),
            ModuleRole::LayerStack          => Some(&self.layers_locator),
            ModuleRole::OutputProjection    => self.output_projection_locator.as_ref(),
            ModuleRole::FinalNorm           => Some(&self.final_norm_locator),
            ModuleRole::OutputHead          => Some(&self.output_head_locator),
        }
    }

    pub fn layer_count(&self, config: &Value) -> Result<u32> {
        let n = self.layer_count_locator.resolve_u64(config)?;
        u32::try_from(n).map_err(|_| RelayError::Config(format!("layer count {n} exceeds u32")))
    }

    pub fn hidden_size(&self, config: &Value) -> Result<usize> {
        let n = self.hidden_size_locator.resolve_u64(config)?;
        usize::try_from(n).map_err(|_| RelayError::Config(format!("hidden size {n} exceeds usize")))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn layer_range_len() {
        let r = LayerRange::new(0, 4);
        assert_eq!(r.len(), 4);
        assert!(!r.is_empty());
        assert!(r.contains(3));
        assert!(!r.contains(4));
        assert!(LayerRange::new(6, 6).is_empty());
    }

    #[test]
    fn locator_parses_indices() {
        let l: Locator = "model.decoder.layers.3".parse().unwrap();
        assert_eq!(l.steps().len(), 4);
        assert_eq!(l.steps()[3], LocatorStep::Index(3));
        assert_eq!(l.to_string(), "model.decoder.layers.3");
    }

    #[test]
    fn locator_rejects_empty_segments() {
        assert!("".parse::<Locator>().is_err());
        assert!("transformer..h".parse::<Locator>().is_err());
    }

    #[test]
    fn resolves_config_values() {
        let cfg = json!({ "n_layer": 12, "n_embd": 768, "nested": { "dims": [1, 2] } });
        let m = ArchitectureManifest::gpt2();
        assert_eq!(m.layer_count(&cfg).unwrap(), 12);
        assert_eq!(m.hidden_size(&cfg).unwrap(), 768);

        let l: Locator = "nested.dims.1".parse().unwrap();
        assert_eq!(l.resolve_u64(&cfg).unwrap(), 2);
    }

    #[test]
    fn missing_config_value_is_an_error() {
        let cfg = json!({ "n_layer": 12 });
        let err = ArchitectureManifest::gpt2().hidden_size(&cfg).unwrap_err();
        assert!(err.to_string().contains("n_embd"));
    }

    #[test]
    fn manifest_serde_uses_dotted_strings() {
        let m = ArchitectureManifest::opt();
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["layers_locator"], "model.decoder.layers");
        assert_eq!(json["positional_index_offset"], 2);
        let round: ArchitectureManifest = serde_json::from_value(json).unwrap();
        assert_eq!(round, m);
    }

    #[test]
    fn optional_fields_default() {
        let json = json!({
            "layer_count_locator": "n_layer",
            "hidden_size_locator": "n_embd",
            "layers_locator": "transformer.h",
            "embedding_locator": "transformer.wte",
            "positional_embedding_locator": "transformer.wpe",
            "final_norm_locator": "transformer.ln_f",
            "output_head_locator": "lm_head",
        });
        let m: ArchitectureManifest = serde_json::from_value(json).unwrap();
        assert_eq!(m, ArchitectureManifest::gpt2());
        assert!(m.locator(ModuleRole::InputProjection).is_none());
    }

    #[test]
    fn roles_sides_and_requirements() {
        assert_eq!(ModuleRole::TokenEmbedding.side(), Side::Input);
        assert_eq!(ModuleRole::LayerStack.side(), Side::Stack);
        assert_eq!(ModuleRole::OutputHead.side(), Side::Output);
        let optional: Vec<_> = ModuleRole::ALL.iter().filter(|r| !r.is_required()).collect();
        assert_eq!(optional.len(), 2);
    }

    #[test]
    fn unknown_builtin() {
        assert!(ArchitectureManifest::builtin("llama").is_err());
        assert_eq!(ArchitectureManifest::builtin("opt").unwrap().positional_index_offset, 2);
    }
}

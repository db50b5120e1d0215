// Pipeline-parallel inference types.
//
// Shared across relay-pipeline, relay-net and relay-node.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::model::LayerRange;

// ── Tensor Dtype ─────────────────────────────────────────────────────────────

/// Activation data type for hidden-state tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TensorDtype {
    #[serde(rename = "float16")]
    F16,
    #[serde(rename = "bfloat16")]
    BF16,
    #[serde(rename = "float32")]
    F32,
}

impl TensorDtype {
    /// Bytes per element for this dtype.
    pub fn element_bytes(&self) -> usize {
        match self {
            Self::F16 | Self::BF16 => 2,
            Self::F32 => 4,
        }
    }
}

impl FromStr for TensorDtype {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float16" | "f16" | "half"   => Ok(Self::F16),
            "bfloat16" | "bf16"          => Ok(Self::BF16),
            "float32" | "f32" | "float"  => Ok(Self::F32),
            other => Err(RelayError::Config(format!("unsupported dtype `{other}`"))),
        }
    }
}

impl std::fmt::Display for TensorDtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::F16  => write!(f, "float16"),
            Self::BF16 => write!(f, "bfloat16"),
            Self::F32  => write!(f, "float32"),
        }
    }
}

// ── Host Tensor ──────────────────────────────────────────────────────────────

/// Backend-independent tensor as carried by the coordination layer.
///
/// `data` holds `shape.product() * dtype.element_bytes()` little-endian bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostTensor {
    pub shape: Vec<usize>,
    pub dtype: TensorDtype,
    pub data: Vec<u8>,
}

impl HostTensor {
    /// Zero-filled receive buffer of the given shape and dtype.
    pub fn zeros(shape: Vec<usize>, dtype: TensorDtype) -> Self {
        let bytes = shape.iter().product::<usize>() * dtype.element_bytes();
        Self { shape, dtype, data: vec![0u8; bytes] }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// True when the byte length agrees with shape and dtype.
    pub fn is_consistent(&self) -> bool {
        self.data.len() == self.element_count() * self.dtype.element_bytes()
    }
}

// ── Pipeline Stage ───────────────────────────────────────────────────────────

/// A single stage in a pipeline-parallel execution plan.
/// Each stage maps to one rank running a contiguous range of layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub rank: u32,
    pub layer_range: LayerRange,
    pub includes_embedding: bool,
    pub includes_output_head: bool,
}

// ── Pipeline Plan ────────────────────────────────────────────────────────────

/// Complete static plan: which rank runs which layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelinePlan {
    pub model_name: String,
    pub total_layers: u32,
    pub hidden_size: usize,
    pub stages: Vec<PipelineStage>,
}

impl PipelinePlan {
    pub fn world_size(&self) -> u32 {
        self.stages.len() as u32
    }

    pub fn stage(&self, rank: u32) -> Option<&PipelineStage> {
        self.stages.get(rank as usize)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

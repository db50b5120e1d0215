// Run configuration. Every value is passed explicitly to the component that
// needs it; nothing here is process-global.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::model::ArchitectureManifest;
use crate::node::RankTopology;
use crate::pipeline::TensorDtype;

/// Environment variable naming this process's entry in `ClusterConfig::nodes`.
pub const NODE_NAME_ENV: &str = "NODE_NAME";

// ── Transport backend ─────────────────────────────────────────────────────────

/// Transport used by the coordination layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Backend {
    /// Star-topology TCP transport rooted at rank 0. `gloo` is accepted as an
    /// alias because it fills the same role.
    Tcp,
}

impl FromStr for Backend {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" | "gloo" => Ok(Self::Tcp),
            "nccl" | "mpi" => Err(RelayError::Config(format!(
                "backend `{s}` is not supported by this build (use `tcp`)"
            ))),
            other => Err(RelayError::Config(format!("unknown backend `{other}`"))),
        }
    }
}

impl TryFrom<String> for Backend {
    type Error = RelayError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Backend> for String {
    fn from(b: Backend) -> Self {
        b.to_string()
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

// ── Node ──────────────────────────────────────────────────────────────────────

/// Configuration for a single participant of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    /// This node's own address, informational.
    pub address: String,
    pub rank: u32,
    #[serde(default = "default_world_size")]
    pub world_size: u32,
    /// Rendezvous host. Rank 0 binds it; every other rank connects to it.
    #[serde(default = "default_master_addr")]
    pub master_addr: String,
    #[serde(default = "default_master_port")]
    pub master_port: u16,
    #[serde(default = "default_backend")]
    pub backend: Backend,
}

fn default_world_size() -> u32 {
    2
}

fn default_master_addr() -> String {
    "0.0.0.0".into()
}

fn default_master_port() -> u16 {
    29501
}

fn default_backend() -> Backend {
    Backend::Tcp
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, rank: u32, world_size: u32) -> Self {
        Self {
            name: name.into(),
            address: "127.0.0.1".into(),
            rank,
            world_size,
            master_addr: default_master_addr(),
            master_port: default_master_port(),
            backend: default_backend(),
        }
    }

    pub fn topology(&self) -> Result<RankTopology> {
        RankTopology::new(self.rank, self.world_size)
    }
}

// ── Model ─────────────────────────────────────────────────────────────────────

/// Where model weights come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSourceConfig {
    /// Deterministically generated weights, identical on every rank that uses
    /// the same seed.
    Synthetic {
        num_layers: u32,
        hidden_size: usize,
        vocab_size: usize,
        max_positions: usize,
        seed: u64,
    },
}

impl Default for ModelSourceConfig {
    fn default() -> Self {
        Self::Synthetic {
            num_layers: 4,
            hidden_size: 32,
            vocab_size: 64,
            max_positions: 128,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model_name: String,
    /// Built-in architecture name, used when `manifest` is not given.
    pub architecture: String,
    /// Explicit manifest; takes precedence over `architecture`.
    pub manifest: Option<ArchitectureManifest>,
    pub dtype: TensorDtype,
    /// `cpu`, `cuda:N` or `metal:N`.
    pub device: String,
    pub source: ModelSourceConfig,
    /// Upper bound on bytes materialised while building a shard.
    pub memory_budget_bytes: Option<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_name: "synthetic-gpt2".into(),
            architecture: "gpt2".into(),
            manifest: None,
            dtype: TensorDtype::F32,
            device: "cpu".into(),
            source: ModelSourceConfig::default(),
            memory_budget_bytes: None,
        }
    }
}

impl ModelConfig {
    /// The manifest in effect: the explicit one, else the built-in one.
    pub fn resolve_manifest(&self) -> Result<ArchitectureManifest> {
        match &self.manifest {
            Some(m) => Ok(m.clone()),
            None => ArchitectureManifest::builtin(&self.architecture),
        }
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// How long rendezvous waits for every rank to join.
    pub rendezvous_timeout_secs: u64,
    /// How long a barrier or broadcast waits for its peers.
    pub collective_timeout_secs: u64,
    /// Delay between connection attempts to the rendezvous master.
    pub connect_retry_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rendezvous_timeout_secs: 60,
            collective_timeout_secs: 300,
            connect_retry_ms: 200,
        }
    }
}

// ── Cluster ───────────────────────────────────────────────────────────────────

/// Full configuration file: every node plus shared model and pipeline
/// settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl ClusterConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: Self =
            serde_json::from_str(json).map_err(|e| RelayError::Serialization(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Nodes must agree on world size, and ranks must be unique and in range.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            node.topology()?;
            if let Some(first) = self.nodes.first() {
                if node.world_size != first.world_size {
                    return Err(RelayError::Config(format!(
                        "node `{}` has world_size {} but `{}` has {}",
                        node.name, node.world_size, first.name, first.world_size
                    )));
                }
            }
            if !seen.insert(node.rank) {
                return Err(RelayError::Config(format!("rank {} assigned twice", node.rank)));
            }
        }
        Ok(())
    }

    pub fn node_named(&self, name: &str) -> Result<&NodeConfig> {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .ok_or_else(|| RelayError::Config(format!("no configuration found for node `{name}`")))
    }

    /// Select this process's node from the `NODE_NAME` environment variable.
    pub fn node_from_env(&self) -> Result<&NodeConfig> {
        let name = std::env::var(NODE_NAME_ENV).map_err(|_| {
            RelayError::Config(format!(
                "the {NODE_NAME_ENV} environment variable must be set (e.g. `mini-red`)"
            ))
        })?;
        self.node_named(&name)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_NODES: &str = r#"{
        "nodes": [
            { "name": "mini-red", "address": "192.168.2.171", "rank": 0,
              "master_addr": "192.168.2.171", "backend": "gloo" },
            { "name": "mini-yellow", "address": "192.168.2.224", "rank": 1,
              "master_addr": "192.168.2.171" }
        ],
        "model": { "architecture": "gpt2", "dtype": "float16" }
    }"#;

    #[test]
    fn parses_cluster_with_defaults() {
        let cfg = ClusterConfig::from_json(TWO_NODES).unwrap();
        let red = cfg.node_named("mini-red").unwrap();
        assert_eq!(red.world_size, 2);
        assert_eq!(red.master_port, 29501);
        assert_eq!(red.backend, Backend::Tcp);
        assert_eq!(cfg.model.dtype, TensorDtype::F16);
        assert_eq!(cfg.model.device, "cpu");
        assert_eq!(cfg.pipeline, PipelineConfig::default());
        assert_eq!(cfg.model.resolve_manifest().unwrap(), ArchitectureManifest::gpt2());
    }

    #[test]
    fn shipped_cluster_config_parses() {
        let cfg = ClusterConfig::from_json(include_str!("../../../configs/cluster.json")).unwrap();
        assert_eq!(cfg.nodes.len(), 2);
        assert_eq!(cfg.node_named("mini-yellow").unwrap().rank, 1);
        assert!(matches!(cfg.model.source, ModelSourceConfig::Synthetic { num_layers: 12, .. }));
    }

    #[test]
    fn unknown_node_is_an_error() {
        let cfg = ClusterConfig::from_json(TWO_NODES).unwrap();
        let err = cfg.node_named("mini-blue").unwrap_err();
        assert!(err.to_string().contains("mini-blue"));
    }

    #[test]
    fn duplicate_rank_rejected() {
        let cfg = ClusterConfig {
            nodes: vec![NodeConfig::new("a", 0, 2), NodeConfig::new("b", 0, 2)],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn mismatched_world_size_rejected() {
        let cfg = ClusterConfig {
            nodes: vec![NodeConfig::new("a", 0, 2), NodeConfig::new("b", 1, 3)],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn backend_names() {
        assert_eq!("gloo".parse::<Backend>().unwrap(), Backend::Tcp);
        assert!("nccl".parse::<Backend>().is_err());
        assert!("carrier-pigeon".parse::<Backend>().is_err());
    }

    #[test]
    fn synthetic_source_round_trip() {
        let src = ModelSourceConfig::default();
        let json = serde_json::to_value(&src).unwrap();
        assert_eq!(json["kind"], "synthetic");
        let round: ModelSourceConfig = serde_json::from_value(json).unwrap();
        assert_eq!(round, src);
    }
}

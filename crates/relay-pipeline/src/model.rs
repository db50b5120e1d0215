// In-memory model representation.
//
// A loaded model is a tree of named and indexed children whose leaves are
// callable modules. The manifest's locators address nodes in this tree; the
// builder detaches what a rank needs and drops the rest.

use std::collections::BTreeMap;
use std::fmt;

use candle_core::{Module, Tensor};
use serde_json::Value;

use relay_types::model::{ArchitectureManifest, LayerRange, Locator, LocatorStep, ModuleRole};
use relay_types::node::RankTopology;

use crate::builder::BuildWarning;
use crate::error::{PipelineError, Result};

/// A callable tensor-to-tensor module.
pub type BoxedModule = Box<dyn Module + Send + Sync>;

// ── Module Tree ───────────────────────────────────────────────────────────────

pub enum ModuleNode {
    Leaf(BoxedModule),
    List(Vec<ModuleNode>),
    Named(BTreeMap<String, ModuleNode>),
    /// A module whose weights were never materialised on this rank.
    Pruned,
}

impl ModuleNode {
    pub fn named<I, S>(children: I) -> Self
    where
        I: IntoIterator<Item = (S, ModuleNode)>,
        S: Into<String>,
    {
        Self::Named(children.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn leaf<M: Module + Send + Sync + 'static>(module: M) -> Self {
        Self::Leaf(Box::new(module))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Leaf(_)  => "leaf",
            Self::List(_)  => "list",
            Self::Named(_) => "named",
            Self::Pruned   => "pruned",
        }
    }

    /// Follow `locator` from this node.
    pub fn get(&self, locator: &Locator) -> std::result::Result<&ModuleNode, String> {
        let mut node = self;
        for step in locator.steps() {
            node = match (node, step) {
                (Self::Named(children), LocatorStep::Field(name)) => children
                    .get(name)
                    .ok_or_else(|| format!("no child named `{name}`"))?,
                (Self::List(items), LocatorStep::Index(i)) => items
                    .get(*i)
                    .ok_or_else(|| format!("index {i} out of bounds (len {})", items.len()))?,
                (other, step) => {
                    return Err(format!("cannot apply `{step}` to a {} node", other.kind()))
                }
            };
        }
        Ok(node)
    }

    fn get_mut(&mut self, locator: &Locator) -> std::result::Result<&mut ModuleNode, String> {
        let mut node = self;
        for step in locator.steps() {
            node = match (node, step) {
                (Self::Named(children), LocatorStep::Field(name)) => children
                    .get_mut(name)
                    .ok_or_else(|| format!("no child named `{name}`"))?,
                (Self::List(items), LocatorStep::Index(i)) => {
                    let len = items.len();
                    items
                        .get_mut(*i)
                        .ok_or_else(|| format!("index {i} out of bounds (len {len})"))?
                }
                (other, step) => {
                    return Err(format!("cannot apply `{step}` to a {} node", other.kind()))
                }
            };
        }
        Ok(node)
    }

    /// Detach the node at `locator`, leaving `Pruned` in its place.
    pub fn take(&mut self, locator: &Locator) -> std::result::Result<ModuleNode, String> {
        let slot = self.get_mut(locator)?;
        Ok(std::mem::replace(slot, Self::Pruned))
    }

    /// Number of materialised leaves below this node.
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Leaf(_) => 1,
            Self::List(items) => items.iter().map(Self::leaf_count).sum(),
            Self::Named(children) => children.values().map(Self::leaf_count).sum(),
            Self::Pruned => 0,
        }
    }
}

impl fmt::Debug for ModuleNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leaf(_) => f.write_str("Leaf"),
            Self::List(items) => f.debug_list().entries(items).finish(),
            Self::Named(children) => f.debug_map().entries(children).finish(),
            Self::Pruned => f.write_str("Pruned"),
        }
    }
}

// ── Model Instance ────────────────────────────────────────────────────────────

/// Sizes read from a model's configuration through its manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelLayout {
    pub total_layers: u32,
    pub hidden_size: usize,
}

/// A loaded model: its configuration object plus its module tree.
#[derive(Debug)]
pub struct ModelInstance {
    pub name: String,
    pub config: Value,
    pub root: ModuleNode,
}

impl ModelInstance {
    pub fn new(name: impl Into<String>, config: Value, root: ModuleNode) -> Self {
        Self { name: name.into(), config, root }
    }

    /// Resolve the node a role points at.
    pub fn resolve(&self, manifest: &ArchitectureManifest, role: ModuleRole) -> Result<&ModuleNode> {
        let locator = manifest.locator(role).ok_or_else(|| PipelineError::ManifestResolution {
            role,
            locator: String::new(),
            reason: "role has no locator in this manifest".into(),
        })?;
        self.root.get(locator).map_err(|reason| resolution_error(role, locator, reason))
    }

    /// Check every locator of `manifest` against this model.
    ///
    /// Pruned nodes pass: a partially loaded model is still well formed.
    pub fn validate(&self, manifest: &ArchitectureManifest) -> Result<ModelLayout> {
        let total_layers = manifest.layer_count(&self.config).map_err(|e| {
            resolution_error(ModuleRole::LayerStack, &manifest.layer_count_locator, e.to_string())
        })?;
        let hidden_size = manifest.hidden_size(&self.config).map_err(|e| {
            resolution_error(ModuleRole::LayerStack, &manifest.hidden_size_locator, e.to_string())
        })?;

        for role in ModuleRole::ALL {
            let Some(locator) = manifest.locator(role) else { continue };
            let node = self.resolve(manifest, role)?;
            let shape_error = |reason: String| resolution_error(role, locator, reason);
            match (role, node) {
                (ModuleRole::LayerStack, ModuleNode::List(items)) => {
                    if items.len() != total_layers as usize {
                        return Err(shape_error(format!(
                            "stack has {} layers, config says {total_layers}",
                            items.len()
                        )));
                    }
                    if let Some(i) = items
                        .iter()
                        .position(|n| !matches!(n, ModuleNode::Leaf(_) | ModuleNode::Pruned))
                    {
                        return Err(shape_error(format!(
                            "layer {i} is a {} node, expected a module",
                            items[i].kind()
                        )));
                    }
                }
                (ModuleRole::LayerStack, other) => {
                    return Err(shape_error(format!("expected a list, found a {} node", other.kind())))
                }
                (_, ModuleNode::Leaf(_) | ModuleNode::Pruned) => {}
                (_, other) => {
                    return Err(shape_error(format!("expected a module, found a {} node", other.kind())))
                }
            }
        }

        Ok(ModelLayout { total_layers, hidden_size })
    }

    /// Unsharded forward pass: token ids `[b, s]` to logits `[b, s, vocab]`.
    ///
    /// Every module must be materialised. Used as the reference the pipeline
    /// is checked against.
    pub fn forward_reference(&self, manifest: &ArchitectureManifest, token_ids: &Tensor) -> Result<Tensor> {
        self.validate(manifest)?;

        let token_embedding = self.leaf(manifest, ModuleRole::TokenEmbedding)?;
        let positional_embedding = self.leaf(manifest, ModuleRole::PositionalEmbedding)?;
        let mut hidden = crate::executor::embed(
            token_embedding,
            positional_embedding,
            token_ids,
            manifest.positional_index_offset,
        )?;
        if manifest.input_projection_locator.is_some() {
            hidden = self.leaf(manifest, ModuleRole::InputProjection)?.forward(&hidden)?;
        }

        let ModuleNode::List(layers) = self.resolve(manifest, ModuleRole::LayerStack)? else {
            return Err(PipelineError::Execution("layer stack is not a list".into()));
        };
        for (i, layer) in layers.iter().enumerate() {
            let ModuleNode::Leaf(layer) = layer else {
                return Err(PipelineError::Execution(format!("layer {i} is not materialised")));
            };
            hidden = layer.forward(&hidden)?;
        }

        if manifest.output_projection_locator.is_some() {
            hidden = self.leaf(manifest, ModuleRole::OutputProjection)?.forward(&hidden)?;
        }
        hidden = self.leaf(manifest, ModuleRole::FinalNorm)?.forward(&hidden)?;
        Ok(self.leaf(manifest, ModuleRole::OutputHead)?.forward(&hidden)?)
    }

    fn leaf(&self, manifest: &ArchitectureManifest, role: ModuleRole) -> Result<&BoxedModule> {
        match self.resolve(manifest, role)? {
            ModuleNode::Leaf(m) => Ok(m),
            other => Err(PipelineError::Execution(format!(
                "{role} is a {} node, expected a materialised module",
                other.kind()
            ))),
        }
    }
}

pub(crate) fn resolution_error(role: ModuleRole, locator: &Locator, reason: String) -> PipelineError {
    PipelineError::ManifestResolution {
        role,
        locator: locator.to_string(),
        reason,
    }
}

// ── Local Model ───────────────────────────────────────────────────────────────

/// A boundary module position: present on the rank that owns it, an explicit
/// placeholder everywhere else.
pub enum Slot<M> {
    Owned(M),
    NotOwned,
}

impl<M> Slot<M> {
    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Owned(_))
    }

    pub fn owned(&self) -> Option<&M> {
        match self {
            Self::Owned(m) => Some(m),
            Self::NotOwned => None,
        }
    }
}

impl<M> fmt::Debug for Slot<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owned(_) => f.write_str("Owned"),
            Self::NotOwned => f.write_str("NotOwned"),
        }
    }
}

/// One rank's shard of the model. Immutable once built.
pub struct LocalModel {
    pub(crate) topology: RankTopology,
    pub(crate) range: LayerRange,
    pub(crate) hidden_size: usize,
    pub(crate) token_embedding: Slot<BoxedModule>,
    pub(crate) positional_embedding: Slot<BoxedModule>,
    pub(crate) input_projection: Option<Slot<BoxedModule>>,
    pub(crate) layers: Vec<BoxedModule>,
    pub(crate) output_projection: Option<Slot<BoxedModule>>,
    pub(crate) final_norm: Slot<BoxedModule>,
    pub(crate) output_head: Slot<BoxedModule>,
    pub(crate) warnings: Vec<BuildWarning>,
}

impl LocalModel {
    pub fn topology(&self) -> RankTopology {
        self.topology
    }

    pub fn range(&self) -> LayerRange {
        self.range
    }

    /// Width of the hidden state handed between ranks.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[BoxedModule] {
        &self.layers
    }

    pub fn warnings(&self) -> &[BuildWarning] {
        &self.warnings
    }

    /// The slot for a boundary role. `None` for the layer stack and for
    /// optional roles the manifest does not declare.
    pub fn slot(&self, role: ModuleRole) -> Option<&Slot<BoxedModule>> {
        match role {
            ModuleRole::TokenEmbedding      => Some(&self.token_embedding),
            ModuleRole::PositionalEmbedding => Some(&self.positional_embedding),
            ModuleRole::InputProjection     => self.input_projection.as_ref(),
            ModuleRole::LayerStack          => None,
            ModuleRole::OutputProjection    => self.output_projection.as_ref(),
            ModuleRole::FinalNorm           => Some(&self.final_norm),
            ModuleRole::OutputHead          => Some(&self.output_head),
        }
    }

    /// Boundary modules this rank owns.
    pub fn owned_roles(&self) -> Vec<ModuleRole> {
        ModuleRole::ALL
            .into_iter()
            .filter(|role| self.slot(*role).is_some_and(Slot::is_owned))
            .collect()
    }
}

impl fmt::Debug for LocalModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalModel")
            .field("topology", &self.topology)
            .field("range", &self.range)
            .field("hidden_size", &self.hidden_size)
            .field("layers", &self.layers.len())
            .field("owned", &self.owned_roles())
            .field("warnings", &self.warnings)
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

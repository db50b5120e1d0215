//! Sharded model construction.
//!
//! [`build_local_model`] consumes a full [`ModelInstance`] and keeps only what
//! one rank runs: its slice of the layer stack, the input-side modules on
//! rank 0 and the output-side modules on the last rank. Everything else is
//! dropped before the function returns, so a rank never holds more than its
//! shard once building is done.

use relay_types::model::{ArchitectureManifest, LayerRange, ModuleRole, Side};
use relay_types::node::RankTopology;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::model::{resolution_error, BoxedModule, LocalModel, ModelInstance, ModuleNode, Slot};

/// Non-fatal conditions noticed while building a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildWarning {
    /// The rank owns no layers; it will pass its input through unchanged.
    EmptyRange { range: LayerRange },
}

/// Prune `full` down to the shard owned by `topology.rank()`.
///
/// Every locator is checked against the model before anything is detached,
/// so a bad manifest fails without partially consuming the tree.
pub fn build_local_model(
    full: ModelInstance,
    manifest: &ArchitectureManifest,
    topology: RankTopology,
    range: LayerRange,
) -> Result<LocalModel> {
    let layout = full.validate(manifest)?;
    if range.end < range.start || range.end > layout.total_layers {
        return Err(PipelineError::Partition(format!(
            "range {range} is outside the {}-layer stack",
            layout.total_layers
        )));
    }

    let ModelInstance { name, mut root, .. } = full;

    // ── 1. Layer stack ───────────────────────────────────────────────────
    let stack_locator = &manifest.layers_locator;
    let stack = root
        .take(stack_locator)
        .map_err(|reason| resolution_error(ModuleRole::LayerStack, stack_locator, reason))?;
    let items = match stack {
        ModuleNode::List(items) => items,
        other => {
            return Err(resolution_error(
                ModuleRole::LayerStack,
                stack_locator,
                format!("expected a list, found a {} node", other.kind()),
            ))
        }
    };
    let layers = items
        .into_iter()
        .enumerate()
        .skip(range.start as usize)
        .take(range.len() as usize)
        .map(|(i, node)| match node {
            ModuleNode::Leaf(m) => Ok(m),
            other => Err(PipelineError::Load(format!(
                "layer {i} is in {range} but is a {} node",
                other.kind()
            ))),
        })
        .collect::<Result<Vec<BoxedModule>>>()?;

    // ── 2. Boundary modules ──────────────────────────────────────────────
    let token_embedding = claim_required(&mut root, manifest, ModuleRole::TokenEmbedding, topology)?;
    let positional_embedding =
        claim_required(&mut root, manifest, ModuleRole::PositionalEmbedding, topology)?;
    let input_projection = claim(&mut root, manifest, ModuleRole::InputProjection, topology)?;
    let output_projection = claim(&mut root, manifest, ModuleRole::OutputProjection, topology)?;
    let final_norm = claim_required(&mut root, manifest, ModuleRole::FinalNorm, topology)?;
    let output_head = claim_required(&mut root, manifest, ModuleRole::OutputHead, topology)?;

    // ── 3. Release everything this rank does not run ─────────────────────
    let released = root.leaf_count();
    drop(root);

    let mut warnings = Vec::new();
    if range.is_empty() {
        warn!(%topology, %range, "rank owns no layers; its stage is a pass-through");
        warnings.push(BuildWarning::EmptyRange { range });
    }

    let local = LocalModel {
        topology,
        range,
        hidden_size: layout.hidden_size,
        token_embedding,
        positional_embedding,
        input_projection,
        layers,
        output_projection,
        final_norm,
        output_head,
        warnings,
    };
    info!(
        model = %name,
        %topology,
        %range,
        owned = ?local.owned_roles(),
        released,
        "built local model"
    );
    Ok(local)
}

fn owns(side: Side, topology: RankTopology) -> bool {
    match side {
        Side::Input => topology.is_first(),
        Side::Output => topology.is_last(),
        Side::Stack => true,
    }
}

/// Detach `role` from the tree. `None` only for an optional role the
/// manifest leaves out.
fn claim(
    root: &mut ModuleNode,
    manifest: &ArchitectureManifest,
    role: ModuleRole,
    topology: RankTopology,
) -> Result<Option<Slot<BoxedModule>>> {
    let Some(locator) = manifest.locator(role) else {
        if role.is_required() {
            return Err(PipelineError::ManifestResolution {
                role,
                locator: String::new(),
                reason: "required role has no locator".into(),
            });
        }
        return Ok(None);
    };
    let node = root
        .take(locator)
        .map_err(|reason| resolution_error(role, locator, reason))?;

    if !owns(role.side(), topology) {
        debug!(%role, %topology, "not owned; released");
        return Ok(Some(Slot::NotOwned));
    }
    match node {
        ModuleNode::Leaf(m) => Ok(Some(Slot::Owned(m))),
        other => Err(PipelineError::Load(format!(
            "{role} at `{locator}` is owned by {topology} but is a {} node",
            other.kind()
        ))),
    }
}

fn claim_required(
    root: &mut ModuleNode,
    manifest: &ArchitectureManifest,
    role: ModuleRole,
    topology: RankTopology,
) -> Result<Slot<BoxedModule>> {
    claim(root, manifest, role, topology)?.ok_or_else(|| PipelineError::ManifestResolution {
        role,
        locator: String::new(),
        reason: "optional role used where a module is required".into(),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::partition;
    use crate::source::{ModelSource, SyntheticFamily, SyntheticModel};
    use candle_core::Device;
    use relay_types::model::Locator;

    fn source(family: SyntheticFamily, layers: u32) -> SyntheticModel {
        SyntheticModel::new(family, layers, 8, 16, 32, 3, Device::Cpu)
    }

    fn build(family: SyntheticFamily, layers: u32, rank: u32, ws: u32) -> LocalModel {
        let manifest = match family {
            SyntheticFamily::Gpt2 => ArchitectureManifest::gpt2(),
            SyntheticFamily::Opt => ArchitectureManifest::opt(),
        };
        let topology = RankTopology::new(rank, ws).unwrap();
        let range = partition(layers, ws).unwrap()[rank as usize];
        build_local_model(source(family, layers).load().unwrap(), &manifest, topology, range).unwrap()
    }

    #[test]
    fn boundary_ownership_across_three_ranks() {
        let first = build(SyntheticFamily::Gpt2, 6, 0, 3);
        assert_eq!(first.layer_count(), 2);
        assert_eq!(
            first.owned_roles(),
            vec![ModuleRole::TokenEmbedding, ModuleRole::PositionalEmbedding]
        );

        let middle = build(SyntheticFamily::Gpt2, 6, 1, 3);
        assert_eq!(middle.range(), LayerRange::new(2, 4));
        assert!(middle.owned_roles().is_empty());
        assert!(!middle.slot(ModuleRole::TokenEmbedding).unwrap().is_owned());
        assert!(!middle.slot(ModuleRole::OutputHead).unwrap().is_owned());

        let last = build(SyntheticFamily::Gpt2, 6, 2, 3);
        assert_eq!(
            last.owned_roles(),
            vec![ModuleRole::FinalNorm, ModuleRole::OutputHead]
        );
    }

    #[test]
    fn single_rank_owns_every_boundary_module() {
        let solo = build(SyntheticFamily::Opt, 4, 0, 1);
        assert_eq!(solo.layer_count(), 4);
        let boundary: Vec<ModuleRole> = ModuleRole::ALL
            .into_iter()
            .filter(|r| *r != ModuleRole::LayerStack)
            .collect();
        assert_eq!(solo.owned_roles(), boundary);
    }

    #[test]
    fn optional_roles_absent_from_manifest_have_no_slot() {
        let local = build(SyntheticFamily::Gpt2, 4, 0, 2);
        assert!(local.slot(ModuleRole::InputProjection).is_none());
        assert!(local.slot(ModuleRole::OutputProjection).is_none());

        let opt = build(SyntheticFamily::Opt, 4, 1, 2);
        assert!(!opt.slot(ModuleRole::InputProjection).unwrap().is_owned());
        assert!(opt.slot(ModuleRole::OutputProjection).unwrap().is_owned());
    }

    #[test]
    fn only_optional_roles_may_be_left_out() {
        let manifest = ArchitectureManifest::gpt2();
        let topology = RankTopology::new(0, 1).unwrap();
        let mut root = source(SyntheticFamily::Gpt2, 2).load().unwrap().root;

        for role in [ModuleRole::InputProjection, ModuleRole::OutputProjection] {
            assert!(!role.is_required());
            assert!(claim(&mut root, &manifest, role, topology).unwrap().is_none());
            assert!(matches!(
                claim_required(&mut root, &manifest, role, topology),
                Err(PipelineError::ManifestResolution { role: r, .. }) if r == role
            ));
        }
        let head = claim_required(&mut root, &manifest, ModuleRole::OutputHead, topology).unwrap();
        assert!(head.is_owned());
    }

    #[test]
    fn empty_range_warns() {
        let local = build(SyntheticFamily::Gpt2, 2, 0, 3);
        assert_eq!(local.layer_count(), 0);
        assert_eq!(
            local.warnings(),
            &[BuildWarning::EmptyRange { range: LayerRange::new(0, 0) }]
        );
        let last = build(SyntheticFamily::Gpt2, 2, 2, 3);
        assert!(last.warnings().is_empty());
    }

    #[test]
    fn unresolvable_locator_is_a_manifest_error() {
        let mut manifest = ArchitectureManifest::gpt2();
        manifest.output_head_locator = Locator::fields(&["head"]);
        let full = source(SyntheticFamily::Gpt2, 4).load().unwrap();
        let err = build_local_model(full, &manifest, RankTopology::solo(), LayerRange::new(0, 4))
            .unwrap_err();
        match err {
            PipelineError::ManifestResolution { role, locator, .. } => {
                assert_eq!(role, ModuleRole::OutputHead);
                assert_eq!(locator, "head");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn range_past_stack_is_rejected() {
        let full = source(SyntheticFamily::Gpt2, 4).load().unwrap();
        let err = build_local_model(
            full,
            &ArchitectureManifest::gpt2(),
            RankTopology::solo(),
            LayerRange::new(0, 5),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Partition(_)));
    }

    #[test]
    fn owned_module_must_be_materialised() {
        let manifest = ArchitectureManifest::gpt2();
        let without_embedding = || {
            let mut full = source(SyntheticFamily::Gpt2, 4).load().unwrap();
            full.root.take(&manifest.embedding_locator).unwrap();
            full
        };

        // Rank 1 never touches the embedding.
        let topo = RankTopology::new(1, 2).unwrap();
        assert!(build_local_model(without_embedding(), &manifest, topo, LayerRange::new(2, 4)).is_ok());

        let topo = RankTopology::new(0, 2).unwrap();
        let err = build_local_model(without_embedding(), &manifest, topo, LayerRange::new(0, 2))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Load(_)));
    }
}

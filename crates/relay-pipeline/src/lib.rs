//! `relay-pipeline`: static pipeline-parallel inference over a layered model.
//!
//! A model is a stack of homogeneous layers plus a handful of boundary
//! modules. Every rank owns a contiguous slice of the stack; rank 0 also
//! owns the input side (embeddings, input projection) and the last rank the
//! output side (output projection, final norm, head).
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   rank 0    │────▶│   rank 1    │────▶│   rank 2    │
//! │ layers 0-3  │     │ layers 4-7  │     │ layers 8-12 │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!       embed         ↑ broadcast            norm + head
//! ```
//!
//! - [`planner`] assigns layer ranges to ranks.
//! - [`builder`] prunes a full model down to one rank's [`LocalModel`].
//! - [`executor`] runs one rank's stage.
//! - [`driver`] threads the hidden state through the process group.

pub mod builder;
pub mod driver;
pub mod error;
pub mod executor;
pub mod model;
pub mod planner;
pub mod source;
pub mod stage;
pub mod tensor;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use builder::{build_local_model, BuildWarning};
pub use driver::{greedy_next_token, run_pipeline, run_rank};
pub use error::{PipelineError, Result};
pub use executor::{run_local_stage, PipelineTensor, StageExecutor};
pub use model::{BoxedModule, LocalModel, ModelInstance, ModuleNode, Slot};
pub use planner::{partition, plan_stages, range_for};
pub use source::{ModelSource, SyntheticFamily, SyntheticModel};
pub use stage::{StageProgress, StageState};

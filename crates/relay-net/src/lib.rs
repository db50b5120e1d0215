//! `relay-net`: the coordination layer of a layer-relay run.
//!
//! A fixed-size process group over TCP, rooted at rank 0 (the rendezvous
//! master). It offers exactly the collectives the pipeline needs:
//!
//! - [`ProcessGroup::barrier`]: every rank waits until all ranks arrive.
//! - [`ProcessGroup::broadcast`]: one source rank's tensor is copied into
//!   every other rank's pre-allocated receive buffer.
//!
//! ```text
//!            ┌────────┐
//!     ┌─────▶│ rank 0 │◀─────┐
//!     │      │  hub   │      │
//!     ▼      └────────┘      ▼
//! ┌────────┐            ┌────────┐
//! │ rank 1 │            │ rank 2 │
//! └────────┘            └────────┘
//! ```
//!
//! A broadcast from a non-zero source travels source → hub → everyone else.

pub mod codec;
pub mod error;
pub mod group;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use codec::{FrameCodec, TensorFrame, WireMessage};
pub use error::{NetError, Result};
pub use group::{GroupConfig, ProcessGroup};

pub mod config;
pub mod error;
pub mod model;
pub mod node;
pub mod pipeline;

pub use error::{RelayError, Result};

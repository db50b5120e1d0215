use relay_net::NetError;
use relay_types::model::ModuleRole;
use relay_types::RelayError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("manifest resolution failed for {role} at `{locator}`: {reason}")]
    ManifestResolution {
        role: ModuleRole,
        locator: String,
        reason: String,
    },

    #[error("partition error: {0}")]
    Partition(String),

    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    #[error("model load error: {0}")]
    Load(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("invalid state transition: {from} → {to}")]
    InvalidTransition { from: String, to: String },

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Config(#[from] RelayError),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, PipelineError>;

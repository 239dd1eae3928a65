use std::sync::Arc;
use thiserror::Error;

/// Failure shared by every caller that joined the same deduplicated operation.
pub type SharedError = Arc<anyhow::Error>;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0} has already been closed")]
    Closed(&'static str),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("failed to resolve the latest tool: {0:#}")]
    Resolve(SharedError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ToolError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

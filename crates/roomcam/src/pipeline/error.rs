//! Error types for pipeline tasks.

use thiserror::Error;

use crate::capture::CaptureError;
use crate::transport::TransportError;

/// Errors that can occur while building or running a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A pipeline needs at least one processor
    #[error("Pipeline has no processors")]
    Empty,

    /// `run()` was called on a task that already ran
    #[error("Pipeline task already running")]
    AlreadyRunning,

    /// A processor failed while handling a frame
    #[error("Processor '{name}' failed: {message}")]
    Processor { name: String, message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// The next stage is gone
    #[error("Frame channel closed")]
    ChannelClosed,

    #[error("Signal handler error: {0}")]
    Signal(#[from] ctrlc::Error),
}

impl PipelineError {
    pub fn processor(name: impl Into<String>, message: impl ToString) -> Self {
        PipelineError::Processor {
            name: name.into(),
            message: message.to_string(),
        }
    }
}

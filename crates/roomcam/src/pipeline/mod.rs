//! Linear frame pipeline: stages, tasks and the runner that drives them.
//!
//! A [`Pipeline`] is an ordered list of [`FrameProcessor`] stages. A
//! [`PipelineTask`] gives every stage its own tokio task and inbox, links
//! neighbours with [`FrameLink`]s and runs until an end frame reaches the
//! tail or the task is cancelled through its [`TaskHandle`].

mod error;
mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod processor;
mod runner;
mod task;

pub use error::PipelineError;
pub use pipeline::Pipeline;
pub use processor::{FrameLink, FrameProcessor};
pub use runner::PipelineRunner;
pub use task::{PipelineTask, TaskHandle};

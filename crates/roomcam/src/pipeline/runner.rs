use super::error::PipelineError;
use super::task::PipelineTask;

/// Drives a [`PipelineTask`] to completion.
///
/// With `handle_sigint` (the default) Ctrl+C cancels the task instead of
/// killing the process, so every stage gets to release its resources.
/// The Ctrl+C handler can only be installed once per process.
#[derive(Debug, Clone, Copy)]
pub struct PipelineRunner {
    handle_sigint: bool,
}

impl Default for PipelineRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineRunner {
    pub fn new() -> Self {
        Self {
            handle_sigint: true,
        }
    }

    pub fn with_sigint(handle_sigint: bool) -> Self {
        Self { handle_sigint }
    }

    pub async fn run(&self, task: &mut PipelineTask) -> Result<(), PipelineError> {
        if self.handle_sigint {
            let handle = task.handle();
            ctrlc::set_handler(move || {
                log::info!("Received Ctrl+C, cancelling pipeline task...");
                handle.cancel();
            })?;
        }

        log::info!("Runner started");
        let result = task.run().await;
        log::info!("Runner finished");
        result
    }
}

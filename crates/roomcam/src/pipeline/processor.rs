use async_trait::async_trait;
use std::sync::Arc;

use super::error::PipelineError;
use super::metrics::TtfbTracker;
use crate::frames::{Frame, FrameDirection, MetricsData, MetricsFrame};

pub(crate) type Envelope = (Frame, FrameDirection);

/// A stage of the pipeline.
///
/// Each stage runs on its own tokio task and receives frames in order, from
/// both directions, through [`process_frame`](FrameProcessor::process_frame).
/// Stages decide what to forward; the default forwards everything.
///
/// Sources that produce frames on their own (capture loops, GStreamer
/// callbacks) clone the [`FrameLink`] when they see the start frame and
/// push from there.
///
/// ```rust,ignore
/// struct Counter(u64);
///
/// #[async_trait]
/// impl FrameProcessor for Counter {
///     fn name(&self) -> &str { "Counter" }
///
///     async fn process_frame(
///         &mut self,
///         frame: Frame,
///         direction: FrameDirection,
///         link: &FrameLink,
///     ) -> Result<(), PipelineError> {
///         if frame.is_data() {
///             self.0 += 1;
///         }
///         link.push(frame, direction)
///     }
/// }
/// ```
#[async_trait]
pub trait FrameProcessor: Send + 'static {
    /// Name used in logs and metrics
    fn name(&self) -> &str;

    /// Handle one frame. Terminal frames (end, cancel) must be forwarded
    /// downstream for the task to finish cleanly.
    async fn process_frame(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        link: &FrameLink,
    ) -> Result<(), PipelineError> {
        link.push(frame, direction)
    }

    /// Called once after the stage handled its terminal frame
    async fn cleanup(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Connection of a stage to its neighbours.
#[derive(Clone)]
pub struct FrameLink {
    name: Arc<str>,
    downstream: flume::Sender<Envelope>,
    upstream: flume::Sender<Envelope>,
    ttfb: Arc<TtfbTracker>,
}

impl FrameLink {
    pub(crate) fn new(
        name: &str,
        downstream: flume::Sender<Envelope>,
        upstream: flume::Sender<Envelope>,
    ) -> Self {
        Self {
            name: Arc::from(name),
            downstream,
            upstream,
            ttfb: Arc::new(TtfbTracker::default()),
        }
    }

    pub(crate) fn ttfb(&self) -> &TtfbTracker {
        &self.ttfb
    }

    /// Name of the stage owning this link
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a frame to the next stage in `direction`
    pub fn push(&self, frame: Frame, direction: FrameDirection) -> Result<(), PipelineError> {
        match direction {
            FrameDirection::Downstream => self.push_downstream(frame),
            FrameDirection::Upstream => self.push_upstream(frame),
        }
    }

    pub fn push_downstream(&self, frame: Frame) -> Result<(), PipelineError> {
        if frame.is_data() {
            if let Some(ttfb) = self.ttfb.observe() {
                log::debug!("{} TTFB: {:?}", self.name, ttfb);
                self.send(
                    &self.downstream,
                    Frame::Metrics(MetricsFrame {
                        processor: self.name.to_string(),
                        data: MetricsData::Ttfb(ttfb),
                    }),
                    FrameDirection::Downstream,
                )?;
            }
        }
        self.send(&self.downstream, frame, FrameDirection::Downstream)
    }

    pub fn push_upstream(&self, frame: Frame) -> Result<(), PipelineError> {
        self.send(&self.upstream, frame, FrameDirection::Upstream)
    }

    /// Report an error towards the head of the pipeline
    pub fn push_error(&self, message: impl Into<String>, fatal: bool) -> Result<(), PipelineError> {
        self.push_upstream(Frame::error(message, fatal))
    }

    fn send(
        &self,
        tx: &flume::Sender<Envelope>,
        frame: Frame,
        direction: FrameDirection,
    ) -> Result<(), PipelineError> {
        tx.send((frame, direction))
            .map_err(|_| PipelineError::ChannelClosed)
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::error::PipelineError;
use super::metrics::{StageMetrics, UsageMetrics};
use super::pipeline::Pipeline;
use super::processor::{Envelope, FrameLink, FrameProcessor};
use crate::config::PipelineParams;
use crate::frames::{Frame, FrameDirection, MetricsData};

/// How long a cancel frame gets to travel through all stages
const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// Clonable control handle of a [`PipelineTask`].
///
/// Cheap to move into event handlers and signal handlers; every method is
/// synchronous.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    head: flume::Sender<Envelope>,
    cancel_tx: watch::Sender<bool>,
    cancelled: AtomicBool,
}

impl TaskHandle {
    /// Cancel the task. A cancel frame flows through every stage; calling
    /// this more than once has no further effect.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("Cancelling pipeline task");
        let _ = self
            .inner
            .head
            .send((Frame::Cancel, FrameDirection::Downstream));
        self.inner.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Queue a frame at the head of the pipeline
    pub fn queue_frame(&self, frame: Frame) -> Result<(), PipelineError> {
        self.inner
            .head
            .send((frame, FrameDirection::Downstream))
            .map_err(|_| PipelineError::ChannelClosed)
    }

    /// Queue an end frame; the task finishes once every stage handled it
    pub fn stop_when_done(&self) -> Result<(), PipelineError> {
        self.queue_frame(Frame::End)
    }
}

/// Resolves once the flag is raised or its sender is gone
async fn raised(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|raised| *raised).await;
}

struct Stage {
    processor: Box<dyn FrameProcessor>,
    inbox: flume::Receiver<Envelope>,
    link: FrameLink,
    stop: watch::Receiver<bool>,
}

impl Stage {
    async fn run(mut self) {
        let name = self.processor.name().to_string();
        let mut metrics = StageMetrics::new(&name);

        loop {
            // a source that ended the stream itself never sees its own end frame
            let (frame, direction) = tokio::select! {
                biased;

                received = self.inbox.recv_async() => match received {
                    Ok(envelope) => envelope,
                    Err(_) => break,
                },
                _ = raised(&mut self.stop) => {
                    log::debug!("[{}] pipeline done, stopping", name);
                    break;
                }
            };
            let downstream = direction == FrameDirection::Downstream;
            match &frame {
                Frame::Start(start) if downstream => {
                    metrics.begin(start);
                    self.link.ttfb().begin(start);
                }
                Frame::Interruption if downstream => self.link.ttfb().rearm(),
                _ => {}
            }

            // terminal frames carry no payload, keep a copy in case the stage fails on them
            let terminal = (downstream && frame.is_terminal()).then(|| frame.clone());
            let is_data = frame.is_data();
            let started = Instant::now();

            if let Err(e) = self.processor.process_frame(frame, direction, &self.link).await {
                log::error!("[{}] {}", name, e);
                let _ = self.link.push_error(e.to_string(), false);
                if let Some(terminal) = &terminal {
                    let _ = self.link.push_downstream(terminal.clone());
                }
            }

            if is_data {
                if let Some(summary) = metrics.record(started.elapsed()) {
                    log::debug!("[{}] {:?}", name, summary.data);
                    let _ = self.link.push_downstream(Frame::Metrics(summary));
                }
            }

            if terminal.is_some() {
                break;
            }
        }

        if let Err(e) = self.processor.cleanup().await {
            log::warn!("[{}] cleanup failed: {}", name, e);
        }
        log::debug!("[{}] stopped", name);
    }
}

enum Outcome {
    Finished,
    Cancelled,
}

/// Runs a [`Pipeline`] until it ends or is cancelled.
///
/// ```text
///  handle.queue_frame ─▶ [stage 0] ─▶ [stage 1] ─▶ ... ─▶ [stage n] ─▶ tail
///  head ◀─────────────── upstream frames (errors, interruptions)
/// ```
pub struct PipelineTask {
    stages: Option<Vec<Stage>>,
    params: PipelineParams,
    handle: TaskHandle,
    head_up_rx: flume::Receiver<Envelope>,
    tail_rx: flume::Receiver<Envelope>,
    stop_tx: watch::Sender<bool>,
    cancel_timeout: Duration,
}

impl PipelineTask {
    pub fn new(pipeline: Pipeline, params: PipelineParams) -> Result<Self, PipelineError> {
        if pipeline.is_empty() {
            return Err(PipelineError::Empty);
        }
        log::info!("Pipeline stages: {}", pipeline.names().join(" -> "));

        let processors = pipeline.into_processors();
        let (inboxes_tx, inboxes_rx): (Vec<_>, Vec<_>) =
            processors.iter().map(|_| flume::unbounded()).unzip();
        let (head_up_tx, head_up_rx) = flume::unbounded();
        let (tail_tx, tail_rx) = flume::unbounded();
        let (stop_tx, _) = watch::channel(false);

        let last = processors.len() - 1;
        let stages = processors
            .into_iter()
            .zip(inboxes_rx)
            .enumerate()
            .map(|(i, (processor, inbox))| {
                let downstream = if i == last {
                    tail_tx.clone()
                } else {
                    inboxes_tx[i + 1].clone()
                };
                let upstream = if i == 0 {
                    head_up_tx.clone()
                } else {
                    inboxes_tx[i - 1].clone()
                };
                let link = FrameLink::new(processor.name(), downstream, upstream);
                Stage {
                    processor,
                    inbox,
                    link,
                    stop: stop_tx.subscribe(),
                }
            })
            .collect();

        let head = inboxes_tx[0].clone();
        // the start frame always leads whatever gets queued before run()
        head.send((Frame::Start(params.into()), FrameDirection::Downstream))
            .map_err(|_| PipelineError::ChannelClosed)?;

        let (cancel_tx, _) = watch::channel(false);
        Ok(Self {
            stages: Some(stages),
            params,
            handle: TaskHandle {
                inner: Arc::new(HandleInner {
                    head,
                    cancel_tx,
                    cancelled: AtomicBool::new(false),
                }),
            },
            head_up_rx,
            tail_rx,
            stop_tx,
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
        })
    }

    pub fn with_cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }

    pub fn params(&self) -> &PipelineParams {
        &self.params
    }

    pub fn handle(&self) -> TaskHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn queue_frame(&self, frame: Frame) -> Result<(), PipelineError> {
        self.handle.queue_frame(frame)
    }

    pub async fn run(&mut self) -> Result<(), PipelineError> {
        let stages = self.stages.take().ok_or(PipelineError::AlreadyRunning)?;

        let handles: Vec<_> = stages
            .into_iter()
            .map(|stage| tokio::spawn(stage.run()))
            .collect();
        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        let mut usage = UsageMetrics::new(self.params.enable_usage_metrics);
        let mut cancel_rx = self.handle.inner.cancel_tx.subscribe();

        let outcome = loop {
            tokio::select! {
                biased;

                _ = raised(&mut cancel_rx) => break Outcome::Cancelled,

                Ok((frame, _)) = self.head_up_rx.recv_async() => self.handle_upstream(frame),

                tail = self.tail_rx.recv_async() => match tail {
                    Ok((Frame::End, _)) => break Outcome::Finished,
                    Ok((Frame::Cancel, _)) => break Outcome::Cancelled,
                    Ok((frame, _)) => Self::consume_tail(frame, &mut usage),
                    Err(_) => break Outcome::Finished,
                },
            }
        };

        if let Outcome::Cancelled = outcome {
            self.drain_until_cancelled(&mut usage).await;
        }
        // stages still waiting for a terminal frame stop and clean up
        self.stop_tx.send_replace(true);

        let joined = tokio::time::timeout(
            self.cancel_timeout,
            futures::future::join_all(handles),
        )
        .await;
        if joined.is_err() {
            log::warn!("Pipeline stages did not stop in time, aborting");
            for handle in abort_handles {
                handle.abort();
            }
        }

        let (frames, bytes) = usage.totals();
        match outcome {
            Outcome::Finished => log::info!(
                "Pipeline task finished ({} frames, {} bytes delivered)",
                frames,
                bytes
            ),
            Outcome::Cancelled => log::info!(
                "Pipeline task cancelled ({} frames, {} bytes delivered)",
                frames,
                bytes
            ),
        }
        Ok(())
    }

    /// Wait for the cancel frame to come out of the last stage
    async fn drain_until_cancelled(&mut self, usage: &mut UsageMetrics) {
        let deadline = tokio::time::sleep(self.cancel_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    log::warn!("Timed out waiting for cancel to reach the end of the pipeline");
                    break;
                }
                tail = self.tail_rx.recv_async() => match tail {
                    Ok((Frame::Cancel, _)) | Ok((Frame::End, _)) | Err(_) => break,
                    Ok((frame, _)) => Self::consume_tail(frame, usage),
                },
            }
        }
    }

    fn handle_upstream(&self, frame: Frame) {
        match frame {
            Frame::Error(error) if error.fatal => {
                log::error!("Fatal pipeline error: {}", error.message);
                self.handle.cancel();
            }
            Frame::Error(error) => log::warn!("Pipeline error: {}", error.message),
            Frame::Interruption if self.params.allow_interruptions => {
                log::debug!("Interruption reached the head, sending downstream");
                let _ = self.handle.queue_frame(Frame::Interruption);
            }
            Frame::Interruption => log::debug!("Interruptions disabled, ignoring"),
            other => log::trace!("Dropping upstream {} frame at head", other.kind()),
        }
    }

    fn consume_tail(frame: Frame, usage: &mut UsageMetrics) {
        match frame {
            Frame::Metrics(metrics) => match metrics.data {
                MetricsData::Ttfb(ttfb) => {
                    log::info!("{} TTFB: {:?}", metrics.processor, ttfb)
                }
                data => log::debug!("{} metrics: {:?}", metrics.processor, data),
            },
            Frame::Error(error) => log::warn!("Error frame reached the tail: {}", error.message),
            frame if frame.is_data() => usage.record(frame.payload_len()),
            _ => {}
        }
    }
}

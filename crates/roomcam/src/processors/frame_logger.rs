use async_trait::async_trait;
use std::time::{Duration, Instant};

use crate::frames::{Frame, FrameDirection};
use crate::pipeline::{FrameLink, FrameProcessor, PipelineError};

const MEDIA_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Pass-through stage that logs the frames it sees.
///
/// Media frames are summarised once per second, everything else is logged
/// as it passes.
pub struct FrameLogger {
    prefix: String,
    media_frames: u64,
    media_bytes: u64,
    last_media_log: Option<Instant>,
}

impl FrameLogger {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            media_frames: 0,
            media_bytes: 0,
            last_media_log: None,
        }
    }

    /// Returns true when a media summary is due
    fn count_media(&mut self, frame: &Frame) -> bool {
        self.media_frames += 1;
        self.media_bytes += frame.payload_len() as u64;
        match self.last_media_log {
            Some(last) if last.elapsed() < MEDIA_LOG_INTERVAL => false,
            _ => {
                self.last_media_log = Some(Instant::now());
                true
            }
        }
    }
}

fn arrow(direction: FrameDirection) -> &'static str {
    match direction {
        FrameDirection::Downstream => "→",
        FrameDirection::Upstream => "←",
    }
}

#[async_trait]
impl FrameProcessor for FrameLogger {
    fn name(&self) -> &str {
        "FrameLogger"
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        link: &FrameLink,
    ) -> Result<(), PipelineError> {
        match &frame {
            Frame::Image(image) => {
                if self.count_media(&frame) {
                    log::info!(
                        "{} {} image {}x{} {} #{} ({} media frames, {} bytes so far)",
                        self.prefix,
                        arrow(direction),
                        image.width,
                        image.height,
                        image.format,
                        image.sequence,
                        self.media_frames,
                        self.media_bytes
                    );
                }
            }
            Frame::Audio(_) => {
                if self.count_media(&frame) {
                    log::info!(
                        "{} {} audio ({} media frames, {} bytes so far)",
                        self.prefix,
                        arrow(direction),
                        self.media_frames,
                        self.media_bytes
                    );
                }
            }
            Frame::Metrics(_) => log::debug!("{} {} {:?}", self.prefix, arrow(direction), frame),
            _ => log::info!("{} {} {:?}", self.prefix, arrow(direction), frame),
        }
        link.push(frame, direction)
    }
}

//! Frames flowing through the pipeline.

use crate::config::PipelineParams;
use std::time::Duration;

/// Direction a frame travels in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    /// From sources towards the room output
    Downstream,
    /// From the room output back towards the sources
    Upstream,
}

/// First frame of every run, carries the task parameters to each stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartFrame {
    pub allow_interruptions: bool,
    pub enable_metrics: bool,
    pub enable_usage_metrics: bool,
    pub report_only_initial_ttfb: bool,
}

impl From<PipelineParams> for StartFrame {
    fn from(params: PipelineParams) -> Self {
        Self {
            allow_interruptions: params.allow_interruptions,
            enable_metrics: params.enable_metrics,
            enable_usage_metrics: params.enable_usage_metrics,
            report_only_initial_ttfb: params.report_only_initial_ttfb,
        }
    }
}

/// A decoded video frame
#[derive(Clone, PartialEq, Eq)]
pub struct ImageRawFrame {
    /// Packed pixel data
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Pixel format, e.g. "RGB"
    pub format: String,
    /// Presentation timestamp in nanoseconds
    pub pts: u64,
    pub sequence: u32,
}

impl ImageRawFrame {
    /// Bytes per row
    pub fn step(&self) -> u32 {
        self.width * bytes_per_pixel(&self.format)
    }
}

impl std::fmt::Debug for ImageRawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageRawFrame")
            .field("size", &format_args!("{}x{}", self.width, self.height))
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .field("pts", &self.pts)
            .field("sequence", &self.sequence)
            .finish()
    }
}

fn bytes_per_pixel(format: &str) -> u32 {
    match format {
        "RGBA" | "BGRA" | "RGBx" | "BGRx" => 4,
        "GRAY8" => 1,
        _ => 3,
    }
}

/// A chunk of interleaved signed 16-bit PCM audio
#[derive(Clone, PartialEq, Eq)]
pub struct AudioRawFrame {
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioRawFrame {
    /// Playback duration of the chunk
    pub fn duration(&self) -> Duration {
        let bytes_per_second = self.sample_rate as u64 * self.channels as u64 * 2;
        if bytes_per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.data.len() as u64 * 1_000_000_000 / bytes_per_second)
    }
}

impl std::fmt::Debug for AudioRawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioRawFrame")
            .field("bytes", &self.data.len())
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    pub message: String,
    /// Fatal errors cancel the task once they reach the head of the pipeline
    pub fatal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricsData {
    /// Time from start to the first data frame produced by a stage
    Ttfb(Duration),
    /// Average processing time per data frame over the last window
    Processing { frames: u64, average: Duration },
    /// Frames and bytes delivered past the end of the pipeline
    Usage { frames: u64, bytes: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsFrame {
    pub processor: String,
    pub data: MetricsData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Start(StartFrame),
    Image(ImageRawFrame),
    Audio(AudioRawFrame),
    Metrics(MetricsFrame),
    Error(ErrorFrame),
    Interruption,
    End,
    Cancel,
}

impl Frame {
    pub fn error(message: impl Into<String>, fatal: bool) -> Self {
        Frame::Error(ErrorFrame {
            message: message.into(),
            fatal,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Start(_) => "start",
            Frame::Image(_) => "image",
            Frame::Audio(_) => "audio",
            Frame::Metrics(_) => "metrics",
            Frame::Error(_) => "error",
            Frame::Interruption => "interruption",
            Frame::End => "end",
            Frame::Cancel => "cancel",
        }
    }

    /// System frames bypass data accounting and are never dropped
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            Frame::Start(_) | Frame::Error(_) | Frame::Interruption | Frame::Cancel
        )
    }

    /// Media frames carrying payload
    pub fn is_data(&self) -> bool {
        matches!(self, Frame::Image(_) | Frame::Audio(_))
    }

    /// Frames after which a stage stops processing
    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::End | Frame::Cancel)
    }

    pub fn payload_len(&self) -> usize {
        match self {
            Frame::Image(image) => image.data.len(),
            Frame::Audio(audio) => audio.data.len(),
            _ => 0,
        }
    }
}

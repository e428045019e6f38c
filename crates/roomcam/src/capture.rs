//! Blocking video capture handle over GStreamer.
//!
//! Opens any URI `uridecodebin` understands (RTSP, files, HTTP) and hands out
//! the most recent decoded frame on each [`VideoCapture::read`] call.

use gstreamer::prelude::*;
use std::time::Duration;
use thiserror::Error;

/// How long `open` waits for the stream to start playing
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur while capturing from a video stream
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("GStreamer error: {0}")]
    GStreamer(#[from] gstreamer::glib::Error),
    #[error("GStreamer state change error: {0}")]
    StateChange(#[from] gstreamer::StateChangeError),
    #[error("Failed to get element by name")]
    ElementNotFound,
    #[error("Failed to downcast pipeline")]
    DowncastError,
    #[error("Failed to get buffer from sample")]
    BufferError,
    #[error("Failed to get caps from sample: {0}")]
    CapsError(String),
    #[error("Capture is not opened")]
    NotOpened,
    #[error("Stream error: {0}")]
    Stream(String),
}

/// Initialize GStreamer once per process
pub fn init() -> Result<(), gstreamer::glib::Error> {
    if !gstreamer::INITIALIZED.load(std::sync::atomic::Ordering::Relaxed) {
        gstreamer::init()?;
    }
    Ok(())
}

/// Pending error or end-of-stream on the pipeline bus, if any
pub(crate) fn poll_bus(pipeline: &gstreamer::Pipeline) -> Option<String> {
    let bus = pipeline.bus()?;
    let msg = bus.pop_filtered(&[gstreamer::MessageType::Error, gstreamer::MessageType::Eos])?;
    match msg.view() {
        gstreamer::MessageView::Error(err) => Some(format!(
            "{} ({})",
            err.error(),
            err.debug().map(|d| d.to_string()).unwrap_or_default()
        )),
        gstreamer::MessageView::Eos(_) => Some("end of stream".to_string()),
        _ => None,
    }
}

/// A frame as decoded by the capture pipeline
pub struct CapturedFrame {
    /// Packed RGB24 pixels
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp in nanoseconds
    pub pts: u64,
}

/// Something frames can be read from, one at a time
pub trait FrameReader: Send {
    /// Next frame, or `Ok(None)` when none arrived within `timeout`
    fn read(&mut self, timeout: Duration) -> Result<Option<CapturedFrame>, CaptureError>;
}

/// Pull-mode capture handle.
///
/// ```text
/// uridecodebin uri={url} ! videoconvert ! videoscale !
///   video/x-raw,format=RGB,width={width},height={height} !
///   appsink name=sink max-buffers=1 drop=true sync=false
/// ```
pub struct VideoCapture {
    url: String,
    pipeline: Option<gstreamer::Pipeline>,
    appsink: Option<gstreamer_app::AppSink>,
}

impl VideoCapture {
    /// Open a capture on `url`, scaled to `width`x`height`.
    ///
    /// Fails if the stream does not reach the playing state within 10 seconds.
    pub fn open(url: &str, width: u32, height: u32) -> Result<Self, CaptureError> {
        init()?;

        let pipeline_desc = capture_description(url, width, height);
        log::debug!("Creating capture pipeline: {}", redact(&pipeline_desc));

        let pipeline = gstreamer::parse::launch(&pipeline_desc)?
            .dynamic_cast::<gstreamer::Pipeline>()
            .map_err(|_| CaptureError::DowncastError)?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or(CaptureError::ElementNotFound)?
            .dynamic_cast::<gstreamer_app::AppSink>()
            .map_err(|_| CaptureError::DowncastError)?;

        let capture = Self {
            url: url.to_string(),
            pipeline: Some(pipeline),
            appsink: Some(appsink),
        };
        capture.start()?;
        Ok(capture)
    }

    fn start(&self) -> Result<(), CaptureError> {
        let pipeline = self.pipeline.as_ref().ok_or(CaptureError::NotOpened)?;
        pipeline.set_state(gstreamer::State::Playing)?;

        let (result, current, _pending) =
            pipeline.state(gstreamer::ClockTime::from_mseconds(OPEN_TIMEOUT.as_millis() as u64));
        result?;
        if let Some(error) = poll_bus(pipeline) {
            return Err(CaptureError::Stream(error));
        }
        if current != gstreamer::State::Playing {
            return Err(CaptureError::Stream(format!(
                "stream did not start playing (state {:?})",
                current
            )));
        }
        log::info!("Capture opened: {}", redact(&self.url));
        Ok(())
    }

    pub fn is_opened(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Read the next frame, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when no frame arrived in time. Stream errors and
    /// end-of-stream are returned as [`CaptureError::Stream`].
    pub fn read(&mut self, timeout: Duration) -> Result<Option<CapturedFrame>, CaptureError> {
        let (pipeline, appsink) = match (&self.pipeline, &self.appsink) {
            (Some(pipeline), Some(appsink)) => (pipeline, appsink),
            _ => return Err(CaptureError::NotOpened),
        };

        if let Some(error) = poll_bus(pipeline) {
            return Err(CaptureError::Stream(error));
        }

        let sample = match appsink.try_pull_sample(gstreamer::ClockTime::from_nseconds(
            timeout.as_nanos() as u64,
        )) {
            Some(sample) => sample,
            None if appsink.is_eos() => {
                return Err(CaptureError::Stream("end of stream".to_string()))
            }
            None => return Ok(None),
        };

        let caps = sample.caps().ok_or(CaptureError::BufferError)?;
        let info = gstreamer_video::VideoInfo::from_caps(caps)
            .map_err(|e| CaptureError::CapsError(e.to_string()))?;

        let buffer = sample.buffer().ok_or(CaptureError::BufferError)?;
        let pts = buffer.pts().map(|t| t.nseconds()).unwrap_or(0);
        let map = buffer
            .map_readable()
            .map_err(|_| CaptureError::BufferError)?;

        Ok(Some(CapturedFrame {
            data: packed_rows(map.as_slice(), &info),
            width: info.width(),
            height: info.height(),
            pts,
        }))
    }

    /// Stop the stream and release the handle. Safe to call more than once.
    pub fn release(&mut self) {
        self.appsink = None;
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.send_event(gstreamer::event::Eos::new());
            if let Err(e) = pipeline.set_state(gstreamer::State::Null) {
                log::warn!("Failed to stop capture pipeline: {}", e);
            }
            log::info!("Capture released: {}", redact(&self.url));
        }
    }
}

impl FrameReader for VideoCapture {
    fn read(&mut self, timeout: Duration) -> Result<Option<CapturedFrame>, CaptureError> {
        VideoCapture::read(self, timeout)
    }
}

impl Drop for VideoCapture {
    fn drop(&mut self) {
        self.release();
    }
}

/// Copy packed pixels of the first plane, dropping any row padding
pub(crate) fn packed_rows(data: &[u8], info: &gstreamer_video::VideoInfo) -> Vec<u8> {
    let pixel_stride = info.format_info().pixel_stride()[0].max(1) as usize;
    let row = info.width() as usize * pixel_stride;
    let stride = info.stride()[0] as usize;
    if stride == row {
        return data.to_vec();
    }
    data.chunks(stride)
        .take(info.height() as usize)
        .flat_map(|line| &line[..row.min(line.len())])
        .copied()
        .collect()
}

fn capture_description(url: &str, width: u32, height: u32) -> String {
    format!(
        "uridecodebin uri={url} ! \
         videoconvert ! \
         videoscale ! \
         video/x-raw,format=RGB,width={width},height={height} ! \
         appsink name=sink max-buffers=1 drop=true sync=false"
    )
}

/// Hide credentials embedded in stream URLs before logging them
pub fn redact(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(scheme_end) = rest.find("://") {
        let (head, tail) = rest.split_at(scheme_end + 3);
        out.push_str(head);
        let authority_end = tail
            .find(|c: char| c == '/' || c.is_whitespace())
            .unwrap_or(tail.len());
        match tail[..authority_end].rfind('@') {
            Some(at) => {
                out.push_str("***");
                out.push_str(&tail[at..authority_end]);
            }
            None => out.push_str(&tail[..authority_end]),
        }
        rest = &tail[authority_end..];
    }
    out.push_str(rest);
    out
}

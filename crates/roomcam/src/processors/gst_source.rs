use async_trait::async_trait;
use futures::StreamExt;
use gstreamer::prelude::*;
use tokio::task::JoinHandle;

use crate::capture::{self, redact, CaptureError};
use crate::config::OutputParams;
use crate::frames::{Frame, FrameDirection, ImageRawFrame};
use crate::pipeline::{FrameLink, FrameProcessor, PipelineError};

/// Name of the app sink the source reads decoded frames from
const APPSINK_NAME: &str = "appsink";

/// Source stage fed by a GStreamer launch pipeline.
///
/// The description either ends in its own `appsink name=appsink` or gets a
/// conversion tail appended:
///
/// ```text
/// {description} ! videoconvert ! videoscale !
///   video/x-raw,format=RGB,width={w},height={h} ! appsink name=appsink sync=false
/// ```
///
/// Playback starts with the start frame. Bus errors are reported upstream as
/// fatal errors, end-of-stream becomes an end frame.
pub struct GstPipelineSource {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    out_params: OutputParams,
    bus_task: Option<JoinHandle<()>>,
}

impl GstPipelineSource {
    pub fn new(description: &str, out_params: OutputParams) -> Result<Self, CaptureError> {
        capture::init()?;

        let pipeline_desc = full_description(description, &out_params);
        log::debug!("Creating source pipeline: {}", redact(&pipeline_desc));

        let pipeline = gstreamer::parse::launch(&pipeline_desc)?
            .dynamic_cast::<gstreamer::Pipeline>()
            .map_err(|_| CaptureError::DowncastError)?;

        let appsink = pipeline
            .by_name(APPSINK_NAME)
            .ok_or(CaptureError::ElementNotFound)?
            .dynamic_cast::<gstreamer_app::AppSink>()
            .map_err(|_| CaptureError::DowncastError)?;

        Ok(Self {
            pipeline,
            appsink,
            out_params,
            bus_task: None,
        })
    }

    fn start(&mut self, link: &FrameLink) -> Result<(), CaptureError> {
        self.appsink.set_callbacks(
            gstreamer_app::AppSinkCallbacks::builder()
                .new_sample({
                    let link = link.clone();
                    let mut seq: u32 = 0;
                    move |sink| {
                        let image = match Self::handle_sample(sink, seq) {
                            Ok(image) => image,
                            Err(e) => {
                                log::warn!("[{}] Dropping sample: {}", link.name(), e);
                                return Ok(gstreamer::FlowSuccess::Ok);
                            }
                        };
                        seq = seq.wrapping_add(1);
                        match link.push_downstream(Frame::Image(image)) {
                            Ok(()) => Ok(gstreamer::FlowSuccess::Ok),
                            Err(_) => Err(gstreamer::FlowError::Flushing),
                        }
                    }
                })
                .build(),
        );

        let bus = self
            .pipeline
            .bus()
            .ok_or_else(|| CaptureError::Stream("pipeline has no bus".to_string()))?;
        let bus_link = link.clone();
        self.bus_task = Some(tokio::spawn(async move {
            let mut messages = bus.stream();
            while let Some(msg) = messages.next().await {
                if forward_bus_message(&msg, &bus_link) {
                    break;
                }
            }
        }));

        self.pipeline.set_state(gstreamer::State::Playing)?;
        log::info!(
            "[{}] Playing, output {}x{}",
            link.name(),
            self.out_params.video_width,
            self.out_params.video_height
        );
        Ok(())
    }

    fn handle_sample(
        sink: &gstreamer_app::AppSink,
        sequence: u32,
    ) -> Result<ImageRawFrame, CaptureError> {
        let sample = sink
            .pull_sample()
            .map_err(|e| CaptureError::Stream(e.to_string()))?;

        let caps = sample.caps().ok_or(CaptureError::BufferError)?;
        let info = gstreamer_video::VideoInfo::from_caps(caps)
            .map_err(|e| CaptureError::CapsError(e.to_string()))?;

        let buffer = sample.buffer().ok_or(CaptureError::BufferError)?;
        let pts = buffer.pts().map(|t| t.nseconds()).unwrap_or(0);

        let map = buffer
            .map_readable()
            .map_err(|_| CaptureError::BufferError)?;

        Ok(ImageRawFrame {
            data: capture::packed_rows(map.as_slice(), &info),
            width: info.width(),
            height: info.height(),
            format: info.format().to_str().to_string(),
            pts,
            sequence,
        })
    }

    fn stop(&mut self) {
        if let Some(bus_task) = self.bus_task.take() {
            bus_task.abort();
        }
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("Failed to stop source pipeline: {}", e);
        }
    }
}

#[async_trait]
impl FrameProcessor for GstPipelineSource {
    fn name(&self) -> &str {
        "GStreamerPipelineSource"
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        link: &FrameLink,
    ) -> Result<(), PipelineError> {
        match (&frame, direction) {
            (Frame::Start(_), FrameDirection::Downstream) => {
                link.push_downstream(frame)?;
                if let Err(e) = self.start(link) {
                    link.push_error(format!("Could not start source pipeline: {}", e), true)?;
                }
                Ok(())
            }
            (Frame::End | Frame::Cancel, FrameDirection::Downstream) => {
                self.stop();
                link.push_downstream(frame)
            }
            _ => link.push(frame, direction),
        }
    }

    async fn cleanup(&mut self) -> Result<(), PipelineError> {
        self.stop();
        Ok(())
    }
}

/// Turn a bus message into pipeline frames. Returns true once the stream is over:
/// errors go upstream as fatal, end-of-stream goes downstream as an end frame.
fn forward_bus_message(msg: &gstreamer::MessageRef, link: &FrameLink) -> bool {
    match msg.view() {
        gstreamer::MessageView::Error(err) => {
            let message = format!(
                "GStreamer error from {:?}: {} ({})",
                err.src().map(|s| s.path_string()),
                err.error(),
                err.debug().map(|d| d.to_string()).unwrap_or_default()
            );
            log::error!("[{}] {}", link.name(), message);
            let _ = link.push_error(message, true);
            true
        }
        gstreamer::MessageView::Eos(_) => {
            log::info!("[{}] End of stream", link.name());
            let _ = link.push_downstream(Frame::End);
            true
        }
        gstreamer::MessageView::Warning(warning) => {
            log::warn!("[{}] GStreamer warning: {}", link.name(), warning.error());
            false
        }
        _ => false,
    }
}

fn full_description(description: &str, out_params: &OutputParams) -> String {
    if description.contains(&format!("name={}", APPSINK_NAME)) {
        return description.to_string();
    }
    format!(
        "{description} ! \
         videoconvert ! \
         videoscale ! \
         video/x-raw,format=RGB,width={width},height={height} ! \
         appsink name={APPSINK_NAME} sync=false",
        width = out_params.video_width,
        height = out_params.video_height,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_description_with_own_appsink_is_kept() {
        let desc = "rtspsrc location=rtsp://cam latency=0 ! rtph264depay ! decodebin ! \
                    videoconvert ! video/x-raw,format=RGB ! appsink name=appsink sync=false";
        assert_eq!(full_description(desc, &OutputParams::default()), desc);
    }

    #[test]
    fn test_description_gets_conversion_tail() {
        let desc = full_description(
            "videotestsrc is-live=true",
            &OutputParams {
                video_width: 320,
                video_height: 240,
            },
        );
        assert!(desc.starts_with("videotestsrc is-live=true ! videoconvert"));
        assert!(desc.contains("width=320,height=240"));
        assert!(desc.ends_with("appsink name=appsink sync=false"));
    }

    #[test]
    fn test_bus_messages_become_frames() {
        capture::init().unwrap();
        let (down_tx, down_rx) = flume::unbounded();
        let (up_tx, up_rx) = flume::unbounded();
        let link = FrameLink::new("source", down_tx, up_tx);

        let warning =
            gstreamer::message::Warning::builder(gstreamer::CoreError::Failed, "slow").build();
        assert!(!forward_bus_message(&warning, &link));
        assert!(down_rx.is_empty() && up_rx.is_empty());

        let eos = gstreamer::message::Eos::new();
        assert!(forward_bus_message(&eos, &link));
        assert_eq!(
            down_rx.try_recv().unwrap(),
            (Frame::End, FrameDirection::Downstream)
        );

        let error =
            gstreamer::message::Error::builder(gstreamer::CoreError::Failed, "camera gone").build();
        assert!(forward_bus_message(&error, &link));
        match up_rx.try_recv().unwrap() {
            (Frame::Error(error), FrameDirection::Upstream) => {
                assert!(error.fatal);
                assert!(error.message.contains("camera gone"));
            }
            other => panic!("expected fatal error, got {:?}", other),
        }
    }

    #[tokio::test]
    #[ignore = "requires GStreamer plugins"]
    async fn test_end_of_stream_ends_pipeline() {
        let mut source = GstPipelineSource::new(
            "videotestsrc num-buffers=3",
            OutputParams {
                video_width: 32,
                video_height: 24,
            },
        )
        .unwrap();
        let (down_tx, down_rx) = flume::unbounded();
        let (up_tx, _up_rx) = flume::unbounded();
        let link = FrameLink::new("source", down_tx, up_tx);

        source
            .process_frame(
                Frame::Start(Default::default()),
                FrameDirection::Downstream,
                &link,
            )
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while kinds.last() != Some(&"end") {
            let (frame, _) = tokio::time::timeout(Duration::from_secs(10), down_rx.recv_async())
                .await
                .expect("no end of stream")
                .unwrap();
            kinds.push(frame.kind());
        }
        assert_eq!(kinds, vec!["start", "image", "image", "image", "end"]);
        source.cleanup().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires GStreamer plugins"]
    async fn test_source_pushes_images() {
        let mut source = GstPipelineSource::new(
            "videotestsrc is-live=true",
            OutputParams {
                video_width: 64,
                video_height: 48,
            },
        )
        .unwrap();

        let (down_tx, down_rx) = flume::unbounded();
        let (up_tx, _up_rx) = flume::unbounded();
        let link = FrameLink::new("source", down_tx, up_tx);

        source
            .process_frame(
                Frame::Start(Default::default()),
                FrameDirection::Downstream,
                &link,
            )
            .await
            .unwrap();

        let (first, _) = down_rx.recv_async().await.unwrap();
        assert_eq!(first.kind(), "start");
        let (second, _) = down_rx.recv_async().await.unwrap();
        match second {
            Frame::Image(image) => {
                assert_eq!((image.width, image.height), (64, 48));
                assert_eq!(image.format, "RGB");
            }
            other => panic!("expected image, got {}", other.kind()),
        }

        source
            .process_frame(Frame::Cancel, FrameDirection::Downstream, &link)
            .await
            .unwrap();
    }
}

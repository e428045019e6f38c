use async_trait::async_trait;
use prost::Message;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use zenoh::bytes::ZBytes;
use zenoh::pubsub::Publisher;
use zenoh::sample::SampleKind;

use super::roster::Roster;
use super::session::open_room_session;
use super::{TransportError, TransportInner};
use crate::frames::{AudioRawFrame, Frame, FrameDirection, ImageRawFrame};
use crate::pipeline::{FrameLink, FrameProcessor, PipelineError};
use crate::schemas::{AudioFrame, VideoFrame};

/// Resources held while the bot is in the room
struct JoinedRoom {
    session: Arc<zenoh::Session>,
    presence: zenoh::liveliness::LivelinessToken,
    camera_pub: Arc<Publisher<'static>>,
    microphone_pub: Publisher<'static>,
    watcher: JoinHandle<()>,
    repeater: Option<JoinHandle<()>>,
}

/// Last stage of the pipeline: joins the room and publishes media.
///
/// Live camera output publishes every image as it arrives. Otherwise the
/// latest image is republished at `camera_out_framerate` until a newer one or
/// an interruption replaces it.
pub struct TransportOutput {
    inner: Arc<TransportInner>,
    room: Option<JoinedRoom>,
    latest_image: watch::Sender<Option<Arc<Vec<u8>>>>,
    size_warned: bool,
    audio_sequence: u32,
    published: u64,
    dropped: u64,
}

impl TransportOutput {
    pub(crate) fn new(inner: Arc<TransportInner>) -> Self {
        let (latest_image, _) = watch::channel(None);
        Self {
            inner,
            room: None,
            latest_image,
            size_warned: false,
            audio_sequence: 0,
            published: 0,
            dropped: 0,
        }
    }

    async fn join(&mut self) -> Result<(), TransportError> {
        if self.room.is_some() {
            return Ok(());
        }
        let inner = &self.inner;
        let session =
            open_room_session(inner.url(), inner.bot_name(), inner.token()).await?;

        let presence = session
            .liveliness()
            .declare_token(inner.presence_key())
            .await?;
        let camera_pub = Arc::new(session.declare_publisher(inner.media_key("camera")).await?);
        let microphone_pub = session
            .declare_publisher(inner.media_key("microphone"))
            .await?;

        let key_prefix = inner.url().key_prefix();
        let subscriber = session
            .liveliness()
            .declare_subscriber(Roster::selector(&key_prefix))
            .history(true)
            .await?;

        let watcher = tokio::spawn({
            let inner = self.inner.clone();
            async move {
                let mut roster = Roster::new(&key_prefix, inner.participant_id());
                while let Ok(sample) = subscriber.recv_async().await {
                    let key = sample.key_expr().as_str();
                    match sample.kind() {
                        SampleKind::Put => {
                            for event in roster.on_put(key) {
                                inner.emit(&event);
                            }
                        }
                        SampleKind::Delete => {
                            if let Some(event) = roster.on_delete(key) {
                                inner.emit(&event);
                            }
                        }
                    }
                }
                log::debug!("Presence watcher stopped");
            }
        });

        let params = inner.params();
        let repeater = (params.camera_out_enabled && !params.camera_out_is_live).then(|| {
            let period = Duration::from_secs(1) / params.camera_out_framerate.max(1);
            let camera_pub = camera_pub.clone();
            tokio::spawn(repeat_latest(
                self.latest_image.subscribe(),
                period,
                move |payload| {
                    let camera_pub = camera_pub.clone();
                    async move { camera_pub.put(ZBytes::from(payload)).await }
                },
            ))
        });

        self.room = Some(JoinedRoom {
            session,
            presence,
            camera_pub,
            microphone_pub,
            watcher,
            repeater,
        });
        self.inner.emit_joined();
        Ok(())
    }

    async fn leave(&mut self) {
        let Some(room) = self.room.take() else {
            return;
        };
        room.watcher.abort();
        if let Some(repeater) = room.repeater {
            repeater.abort();
        }
        if let Err(e) = room.presence.undeclare().await {
            log::warn!("Failed to withdraw presence: {}", e);
        }
        drop(room.camera_pub);
        drop(room.microphone_pub);
        if let Err(e) = room.session.close().await {
            log::warn!("Failed to close Zenoh session: {}", e);
        }
        log::info!(
            "Room output stopped: {} frames published, {} dropped",
            self.published,
            self.dropped
        );
        self.inner.emit_left();
    }

    /// Warn once when frames do not match the configured output size.
    /// Returns true when this frame triggered the warning.
    fn check_size(&mut self, image: &ImageRawFrame) -> bool {
        let params = self.inner.params();
        if self.size_warned
            || (image.width == params.camera_out_width && image.height == params.camera_out_height)
        {
            return false;
        }
        log::warn!(
            "Camera frames are {}x{}, room output is configured for {}x{}",
            image.width,
            image.height,
            params.camera_out_width,
            params.camera_out_height
        );
        self.size_warned = true;
        true
    }

    async fn write_image(&mut self, image: &ImageRawFrame) {
        if !self.inner.params().camera_out_enabled {
            return;
        }
        self.check_size(image);

        let payload = VideoFrame::from_image(image, self.inner.participant_id()).encode_to_vec();
        if !self.inner.params().camera_out_is_live {
            // the repeater publishes it while joined
            self.latest_image.send_replace(Some(Arc::new(payload)));
            return;
        }

        let Some(room) = &self.room else {
            self.dropped += 1;
            return;
        };
        match room.camera_pub.put(ZBytes::from(payload)).await {
            Ok(()) => self.published += 1,
            Err(e) => {
                self.dropped += 1;
                log::warn!("Failed to publish camera frame: {}", e);
            }
        }
    }

    async fn write_audio(&mut self, audio: &AudioRawFrame) {
        let params = self.inner.params();
        if !params.audio_out_enabled {
            return;
        }
        let Some(room) = &self.room else {
            self.dropped += 1;
            return;
        };

        let payload =
            AudioFrame::from_audio(audio, self.audio_sequence, self.inner.participant_id())
                .encode_to_vec();
        self.audio_sequence = self.audio_sequence.wrapping_add(1);
        match room.microphone_pub.put(ZBytes::from(payload)).await {
            Ok(()) => self.published += 1,
            Err(e) => {
                self.dropped += 1;
                log::warn!("Failed to publish audio frame: {}", e);
            }
        }

        if !params.audio_out_is_live {
            // play out at real-time speed
            tokio::time::sleep(audio.duration()).await;
        }
    }
}

/// Republish the latest camera payload at a fixed rate until the sender is gone
async fn repeat_latest<P, F>(
    latest: watch::Receiver<Option<Arc<Vec<u8>>>>,
    period: Duration,
    mut publish: P,
) where
    P: FnMut(Vec<u8>) -> F,
    F: Future<Output = zenoh::Result<()>>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        if latest.has_changed().is_err() {
            break;
        }
        let Some(payload) = latest.borrow().clone() else {
            continue;
        };
        if let Err(e) = publish(Vec::clone(&payload)).await {
            log::warn!("Failed to republish camera frame: {}", e);
        }
    }
}

#[async_trait]
impl FrameProcessor for TransportOutput {
    fn name(&self) -> &str {
        "RoomTransportOutput"
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        link: &FrameLink,
    ) -> Result<(), PipelineError> {
        if direction == FrameDirection::Upstream {
            return link.push_upstream(frame);
        }

        match &frame {
            Frame::Start(_) => {
                if let Err(e) = self.join().await {
                    log::error!("Failed to join room {}: {}", self.inner.url(), e);
                    link.push_error(format!("Failed to join room: {}", e), true)?;
                }
            }
            Frame::Image(image) => self.write_image(image).await,
            Frame::Audio(audio) => self.write_audio(audio).await,
            Frame::Interruption => {
                self.latest_image.send_replace(None);
            }
            Frame::End | Frame::Cancel => self.leave().await,
            _ => {}
        }
        link.push_downstream(frame)
    }

    async fn cleanup(&mut self) -> Result<(), PipelineError> {
        self.leave().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportParams;
    use crate::transport::RoomTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn image(width: u32, height: u32) -> ImageRawFrame {
        ImageRawFrame {
            data: vec![0; (width * height * 3) as usize],
            width,
            height,
            format: "RGB".to_string(),
            pts: 0,
            sequence: 0,
        }
    }

    fn output(params: TransportParams) -> TransportOutput {
        RoomTransport::new("tcp://127.0.0.1:7447/lobby", None, "bot", params)
            .unwrap()
            .output()
    }

    fn link() -> (FrameLink, flume::Receiver<(Frame, FrameDirection)>) {
        let (down_tx, down_rx) = flume::unbounded();
        let (up_tx, _up_rx) = flume::unbounded();
        (FrameLink::new("output", down_tx, up_tx), down_rx)
    }

    #[tokio::test]
    async fn test_latest_image_repeated_until_cleared() {
        let (latest_tx, latest_rx) = watch::channel(None);
        latest_tx.send_replace(Some(Arc::new(vec![1, 2, 3])));

        let published = Arc::new(AtomicUsize::new(0));
        let repeater = tokio::spawn(repeat_latest(latest_rx, Duration::from_millis(10), {
            let published = published.clone();
            move |payload| {
                let published = published.clone();
                async move {
                    assert_eq!(payload, vec![1, 2, 3]);
                    published.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), zenoh::Error>(())
                }
            }
        }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(published.load(Ordering::SeqCst) >= 3);

        // an interruption clears the stored image, nothing is republished
        latest_tx.send_replace(None);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let cleared_at = published.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(published.load(Ordering::SeqCst), cleared_at);

        drop(latest_tx);
        tokio::time::timeout(Duration::from_secs(1), repeater)
            .await
            .expect("repeater did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_non_live_image_stored_and_interruption_drops_it() {
        let mut output = output(TransportParams {
            camera_out_is_live: false,
            ..Default::default()
        });
        let (link, down_rx) = link();

        output
            .process_frame(
                Frame::Image(image(1280, 720)),
                FrameDirection::Downstream,
                &link,
            )
            .await
            .unwrap();
        let stored = output.latest_image.borrow().clone().unwrap();
        let frame = VideoFrame::decode(stored.as_slice()).unwrap();
        assert_eq!((frame.width, frame.height), (1280, 720));

        output
            .process_frame(Frame::Interruption, FrameDirection::Downstream, &link)
            .await
            .unwrap();
        assert!(output.latest_image.borrow().is_none());

        let kinds: Vec<_> = down_rx.try_iter().map(|(f, _)| f.kind()).collect();
        assert_eq!(kinds, vec!["image", "interruption"]);
    }

    #[tokio::test]
    async fn test_live_image_dropped_before_joining() {
        let mut output = output(TransportParams::default());
        let (link, down_rx) = link();

        output
            .process_frame(
                Frame::Image(image(1280, 720)),
                FrameDirection::Downstream,
                &link,
            )
            .await
            .unwrap();
        assert_eq!(output.dropped, 1);
        assert!(output.latest_image.borrow().is_none());
        // still forwarded
        assert_eq!(down_rx.try_recv().unwrap().0.kind(), "image");
    }

    #[test]
    fn test_size_mismatch_warned_once() {
        let mut output = output(TransportParams::default());
        assert!(!output.check_size(&image(1280, 720)));
        assert!(output.check_size(&image(640, 480)));
        assert!(!output.check_size(&image(640, 480)));
        assert!(!output.check_size(&image(320, 240)));
    }
}

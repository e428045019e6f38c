use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::capture::{redact, CaptureError, CapturedFrame, FrameReader, VideoCapture};
use crate::config::CaptureParams;
use crate::frames::{Frame, FrameDirection, ImageRawFrame};
use crate::pipeline::{FrameLink, FrameProcessor, PipelineError};

/// Granularity of sleeps in the capture loop, bounds shutdown latency
const STOP_POLL: Duration = Duration::from_millis(50);

/// Source stage polling a [`VideoCapture`] handle.
///
/// On the start frame a blocking worker opens the capture and loops: read a
/// frame, wrap it as an RGB image, push it downstream, then sleep until the
/// next tick. A failed read sleeps `retry_delay` and tries again; a broken
/// stream is reopened. Failing to open the stream the first time is fatal.
pub struct CaptureSource {
    url: String,
    params: CaptureParams,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureSource {
    pub fn new(url: impl Into<String>, params: CaptureParams) -> Self {
        Self {
            url: url.into(),
            params,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    fn start(&mut self, link: &FrameLink) {
        self.stop.store(false, Ordering::Relaxed);
        let url = self.url.clone();
        let params = self.params;
        let link = link.clone();
        let stop = self.stop.clone();
        self.worker = Some(tokio::task::spawn_blocking(move || {
            let open = || VideoCapture::open(&url, params.width, params.height);
            capture_loop(&url, open, params, &link, &stop)
        }));
    }

    async fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let budget = self.params.read_timeout() + self.params.retry_delay + Duration::from_secs(1);
            if tokio::time::timeout(budget, worker).await.is_err() {
                log::warn!("Capture worker for {} did not stop in time", redact(&self.url));
            }
        }
    }
}

#[async_trait]
impl FrameProcessor for CaptureSource {
    fn name(&self) -> &str {
        "CameraProcessor"
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
                self.start(link);
                Ok(())
            }
            (Frame::End | Frame::Cancel, FrameDirection::Downstream) => {
                self.stop().await;
                link.push_downstream(frame)
            }
            _ => link.push(frame, direction),
        }
    }

    async fn cleanup(&mut self) -> Result<(), PipelineError> {
        self.stop().await;
        Ok(())
    }
}

/// Wrap a captured frame as a pipeline image
fn encode_frame(frame: CapturedFrame, sequence: u32) -> ImageRawFrame {
    ImageRawFrame {
        data: frame.data,
        width: frame.width,
        height: frame.height,
        format: "RGB".to_string(),
        pts: frame.pts,
        sequence,
    }
}

/// Sleep for `duration`, waking early when `stop` is set
fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(STOP_POLL));
    }
}

/// Read, push and pace frames until `stop` is set.
///
/// A read waits up to [`CaptureParams::read_timeout`], so a camera slower
/// than the poll rate is waited for rather than counted as a failure.
fn capture_loop<R, F>(url: &str, open: F, params: CaptureParams, link: &FrameLink, stop: &AtomicBool)
where
    R: FrameReader,
    F: Fn() -> Result<R, CaptureError>,
{
    let mut capture = match open() {
        Ok(capture) => Some(capture),
        Err(e) => {
            let message = format!("Could not open camera stream at {}: {}", redact(url), e);
            log::error!("{}", message);
            let _ = link.push_error(message, true);
            return;
        }
    };

    let interval = params.frame_interval();
    let read_timeout = params.read_timeout();
    let mut sequence: u32 = 0;
    let mut sent: u64 = 0;
    let mut failed: u64 = 0;
    let mut last_log = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        let tick = Instant::now();

        if capture.is_none() {
            match open() {
                Ok(reopened) => {
                    log::info!("Reconnected to {}", redact(url));
                    capture = Some(reopened);
                }
                Err(e) => {
                    log::warn!("Reconnect to {} failed: {}", redact(url), e);
                    sleep_unless_stopped(params.retry_delay, stop);
                    continue;
                }
            }
        }
        let Some(handle) = capture.as_mut() else {
            continue;
        };

        match handle.read(read_timeout) {
            Ok(Some(frame)) => {
                let image = encode_frame(frame, sequence);
                sequence = sequence.wrapping_add(1);
                if link.push_downstream(Frame::Image(image)).is_err() {
                    log::debug!("Downstream closed, stopping capture");
                    break;
                }
                sent += 1;
            }
            Ok(None) => {
                failed += 1;
                log::warn!(
                    "No frame from {} within {:?}, retrying",
                    redact(url),
                    read_timeout
                );
                sleep_unless_stopped(params.retry_delay, stop);
                continue;
            }
            Err(CaptureError::Stream(e)) => {
                failed += 1;
                log::warn!("Stream {} broke: {}, reopening", redact(url), e);
                capture = None;
                sleep_unless_stopped(params.retry_delay, stop);
                continue;
            }
            Err(e) => {
                failed += 1;
                log::warn!("Failed to read frame: {}", e);
                sleep_unless_stopped(params.retry_delay, stop);
                continue;
            }
        }

        if last_log.elapsed().as_secs() >= 1 {
            log::debug!(
                "Capture {}: frame {}, {} sent, {} failed reads",
                redact(url),
                sequence,
                sent,
                failed
            );
            last_log = Instant::now();
        }

        let elapsed = tick.elapsed();
        if elapsed < interval {
            sleep_unless_stopped(interval - elapsed, stop);
        }
    }

    // releases the capture
    drop(capture);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame() {
        let frame = CapturedFrame {
            data: vec![7; 2 * 2 * 3],
            width: 2,
            height: 2,
            pts: 42,
        };
        let image = encode_frame(frame, 9);
        assert_eq!(image.format, "RGB");
        assert_eq!(image.step(), 6);
        assert_eq!(image.pts, 42);
        assert_eq!(image.sequence, 9);
        assert_eq!(image.data.len(), 12);
    }

    /// Camera producing a frame every `period`, optionally broken on first read
    struct FakeCamera {
        period: Duration,
        next: Instant,
        broken: bool,
    }

    impl FakeCamera {
        fn new(period: Duration, broken: bool) -> Self {
            Self {
                period,
                next: Instant::now() + period,
                broken,
            }
        }
    }

    impl FrameReader for FakeCamera {
        fn read(&mut self, timeout: Duration) -> Result<Option<CapturedFrame>, CaptureError> {
            if std::mem::take(&mut self.broken) {
                return Err(CaptureError::Stream("connection reset".to_string()));
            }
            let now = Instant::now();
            if self.next > now + timeout {
                std::thread::sleep(timeout);
                return Ok(None);
            }
            std::thread::sleep(self.next.saturating_duration_since(now));
            self.next += self.period;
            Ok(Some(CapturedFrame {
                data: vec![0; 2 * 2 * 3],
                width: 2,
                height: 2,
                pts: 0,
            }))
        }
    }

    fn params(fps: u32, retry_delay: Duration) -> CaptureParams {
        CaptureParams {
            width: 2,
            height: 2,
            fps,
            retry_delay,
        }
    }

    /// Run the capture loop on a thread until `count` images arrived
    fn collect_images<R, F>(open: F, params: CaptureParams, count: usize) -> Vec<u32>
    where
        R: FrameReader,
        F: Fn() -> Result<R, CaptureError> + Send,
    {
        let (down_tx, down_rx) = flume::unbounded();
        let (up_tx, _up_rx) = flume::unbounded();
        let link = FrameLink::new("camera", down_tx, up_tx);
        let stop = AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| capture_loop("rtsp://cam/live", open, params, &link, &stop));
            let mut sequences = Vec::new();
            while sequences.len() < count {
                match down_rx.recv_timeout(Duration::from_secs(5)) {
                    Ok((Frame::Image(image), _)) => sequences.push(image.sequence),
                    Ok(_) => {}
                    Err(e) => {
                        stop.store(true, Ordering::Relaxed);
                        panic!("capture stalled after {} images: {}", sequences.len(), e);
                    }
                }
            }
            stop.store(true, Ordering::Relaxed);
            sequences
        })
    }

    #[test]
    fn test_camera_slower_than_poll_rate_is_not_a_failure() {
        // 15 fps camera polled at 30 fps; a miss would stall for the retry delay
        let started = Instant::now();
        let sequences = collect_images(
            || Ok(FakeCamera::new(Duration::from_millis(66), false)),
            params(30, Duration::from_secs(3)),
            5,
        );
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_broken_stream_is_reopened() {
        let opens = std::sync::atomic::AtomicUsize::new(0);
        let sequences = collect_images(
            || {
                let first = opens.fetch_add(1, Ordering::SeqCst) == 0;
                Ok(FakeCamera::new(Duration::from_millis(10), first))
            },
            params(50, Duration::from_millis(20)),
            3,
        );
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_sleep_wakes_on_stop() {
        let stop = AtomicBool::new(true);
        let started = Instant::now();
        sleep_unless_stopped(Duration::from_secs(5), &stop);
        assert!(started.elapsed() < Duration::from_secs(1));

        let stop = AtomicBool::new(false);
        let started = Instant::now();
        sleep_unless_stopped(Duration::from_millis(60), &stop);
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_open_failure_is_fatal() {
        let mut source = CaptureSource::new(
            "rtsp://127.0.0.1:1/missing",
            CaptureParams {
                width: 64,
                height: 48,
                fps: 10,
                retry_delay: Duration::from_millis(10),
            },
        );
        let (down_tx, down_rx) = flume::unbounded();
        let (up_tx, up_rx) = flume::unbounded();
        let link = FrameLink::new("camera", down_tx, up_tx);

        source
            .process_frame(
                Frame::Start(Default::default()),
                FrameDirection::Downstream,
                &link,
            )
            .await
            .unwrap();
        assert_eq!(down_rx.recv_async().await.unwrap().0.kind(), "start");

        // either GStreamer is missing or the connection is refused, both are fatal
        let (frame, direction) = tokio::time::timeout(Duration::from_secs(30), up_rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(direction, FrameDirection::Upstream);
        match frame {
            Frame::Error(error) => {
                assert!(error.fatal);
                assert!(error.message.starts_with("Could not open camera stream"));
            }
            other => panic!("expected error, got {}", other.kind()),
        }

        source
            .process_frame(Frame::Cancel, FrameDirection::Downstream, &link)
            .await
            .unwrap();
        assert_eq!(down_rx.recv_async().await.unwrap().0.kind(), "cancel");
    }
}

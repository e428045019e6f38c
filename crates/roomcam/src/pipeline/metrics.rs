use crate::frames::{MetricsData, MetricsFrame, StartFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Metrics are summarised at most once per window
const REPORT_WINDOW: Duration = Duration::from_secs(1);

/// Time-to-first-byte bookkeeping for one stage.
///
/// Shared between the stage loop and any producer task pushing through
/// the stage's link, so the first data frame is measured wherever it comes from.
#[derive(Debug, Default)]
pub(crate) struct TtfbTracker {
    started_at: Mutex<Option<Instant>>,
    pending: AtomicBool,
    enabled: AtomicBool,
    initial_only: AtomicBool,
}

impl TtfbTracker {
    pub fn begin(&self, start: &StartFrame) {
        self.enabled.store(start.enable_metrics, Ordering::Relaxed);
        self.initial_only
            .store(start.report_only_initial_ttfb, Ordering::Relaxed);
        self.arm();
    }

    /// Measure again after an interruption, unless only the first one counts
    pub fn rearm(&self) {
        if !self.initial_only.load(Ordering::Relaxed) {
            self.arm();
        }
    }

    fn arm(&self) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        if let Ok(mut started_at) = self.started_at.lock() {
            *started_at = Some(Instant::now());
        }
        self.pending.store(true, Ordering::Release);
    }

    /// Returns the TTFB the first time a data frame goes out after arming
    pub fn observe(&self) -> Option<Duration> {
        if !self.pending.swap(false, Ordering::AcqRel) {
            return None;
        }
        let started_at = self.started_at.lock().ok()?;
        started_at.map(|t| t.elapsed())
    }
}

/// Processing-time accumulator for one stage loop
pub(crate) struct StageMetrics {
    name: String,
    enabled: bool,
    frames: u64,
    total: Duration,
    last_report: Instant,
}

impl StageMetrics {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: false,
            frames: 0,
            total: Duration::ZERO,
            last_report: Instant::now(),
        }
    }

    pub fn begin(&mut self, start: &StartFrame) {
        self.enabled = start.enable_metrics;
        self.frames = 0;
        self.total = Duration::ZERO;
        self.last_report = Instant::now();
    }

    /// Records one data frame; yields a summary once per window
    pub fn record(&mut self, elapsed: Duration) -> Option<MetricsFrame> {
        if !self.enabled {
            return None;
        }
        self.frames += 1;
        self.total += elapsed;

        if self.last_report.elapsed() < REPORT_WINDOW {
            return None;
        }
        let average = self.total / self.frames.max(1) as u32;
        let frame = MetricsFrame {
            processor: self.name.clone(),
            data: MetricsData::Processing {
                frames: self.frames,
                average,
            },
        };
        self.frames = 0;
        self.total = Duration::ZERO;
        self.last_report = Instant::now();
        Some(frame)
    }
}

/// Frames and bytes delivered past the tail of the pipeline
pub(crate) struct UsageMetrics {
    enabled: bool,
    frames: u64,
    bytes: u64,
    last_report: Instant,
}

impl UsageMetrics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            frames: 0,
            bytes: 0,
            last_report: Instant::now(),
        }
    }

    pub fn record(&mut self, bytes: usize) {
        if !self.enabled {
            return;
        }
        self.frames += 1;
        self.bytes += bytes as u64;

        if self.last_report.elapsed() >= REPORT_WINDOW {
            log::info!(
                "Usage: {} frames, {} bytes delivered",
                self.frames,
                self.bytes
            );
            self.last_report = Instant::now();
        }
    }

    pub fn totals(&self) -> (u64, u64) {
        (self.frames, self.bytes)
    }
}

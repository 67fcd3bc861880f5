//! Aggregate download speed: a shared byte counter with periodic sampling.
//!
//! Workers report bytes as they land; consumers poll the sampled rate or
//! subscribe to a periodic formatted report.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::events::{EventHandlers, Handler};

/// Minimum spacing between samples; polls inside this window read 0 instead
/// of a noisy spike.
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

struct Sample {
    bytes: u64,
    at: Instant,
}

struct TrackerInner {
    total_bytes: AtomicU64,
    last_sample: Mutex<Sample>,
    reports: EventHandlers<String>,
    monitoring: AtomicBool,
    stop: AtomicBool,
}

/// Thread-safe cumulative byte counter with rate sampling.
pub struct DownloadSpeedTracker {
    inner: Arc<TrackerInner>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadSpeedTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                total_bytes: AtomicU64::new(0),
                last_sample: Mutex::new(Sample {
                    bytes: 0,
                    at: Instant::now(),
                }),
                reports: EventHandlers::new(),
                monitoring: AtomicBool::new(false),
                stop: AtomicBool::new(false),
            }),
            sampler: Mutex::new(None),
        }
    }

    /// Adds `n` to the cumulative total. Callable from any worker.
    pub fn report_bytes(&self, n: u64) {
        self.inner.total_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Total bytes reported so far.
    pub fn total_bytes(&self) -> u64 {
        self.inner.total_bytes.load(Ordering::Relaxed)
    }

    /// Bytes per second since the previous sample. Returns 0.0 when called
    /// within [`MIN_SAMPLE_INTERVAL`] of the previous sample.
    pub fn get_speed_bytes_per_second(&self) -> f64 {
        self.inner.sample_speed()
    }

    /// Current speed scaled to B/s, KiB/s or MiB/s. Never empty.
    pub fn get_speed_formatted(&self) -> String {
        format_speed(self.get_speed_bytes_per_second())
    }

    /// Registers a subscriber for periodic formatted reports.
    pub fn subscribe(&self, handler: Handler<String>) {
        self.inner.reports.subscribe(handler);
    }

    /// Starts the periodic sampler; each tick emits a formatted report to
    /// subscribers. Calling again while active is a no-op.
    pub fn start_monitoring(&self, interval: Duration) {
        if self.inner.monitoring.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.stop.store(false, Ordering::Release);
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("mtdm-speed".into())
            .spawn(move || loop {
                std::thread::sleep(interval);
                if inner.stop.load(Ordering::Acquire) {
                    break;
                }
                let report = format_speed(inner.sample_speed());
                inner.reports.emit(&report);
            })
            .ok();
        *self.sampler.lock().unwrap() = handle;
    }

    /// Stops the sampler. No report is emitted after this returns.
    pub fn stop_monitoring(&self) {
        if !self.inner.monitoring.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.stop.store(true, Ordering::Release);
        if let Some(handle) = self.sampler.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Stops monitoring and drops subscribers.
    pub fn dispose(&self) {
        self.stop_monitoring();
    }
}

impl Default for DownloadSpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DownloadSpeedTracker {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

impl TrackerInner {
    fn sample_speed(&self) -> f64 {
        let mut sample = self.last_sample.lock().unwrap();
        let elapsed = sample.at.elapsed();
        if elapsed < MIN_SAMPLE_INTERVAL {
            return 0.0;
        }
        let total = self.total_bytes.load(Ordering::Relaxed);
        let grown = total.saturating_sub(sample.bytes);
        let speed = grown as f64 / elapsed.as_secs_f64();
        sample.bytes = total;
        sample.at = Instant::now();
        speed
    }
}

/// Scales a byte rate to B/s, KiB/s or MiB/s (1024 base).
pub fn format_speed(bytes_per_second: f64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    if bytes_per_second < KIB {
        format!("{:.0} B/s", bytes_per_second)
    } else if bytes_per_second < MIB {
        format!("{:.1} KiB/s", bytes_per_second / KIB)
    } else {
        format!("{:.1} MiB/s", bytes_per_second / MIB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn totals_accumulate_from_many_threads() {
        let tracker = Arc::new(DownloadSpeedTracker::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let t = Arc::clone(&tracker);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    t.report_bytes(3);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tracker.total_bytes(), 12_000);
    }

    #[test]
    fn sample_inside_window_reads_zero() {
        let tracker = DownloadSpeedTracker::new();
        tracker.report_bytes(1_000_000);
        assert_eq!(tracker.get_speed_bytes_per_second(), 0.0);
        assert_eq!(tracker.get_speed_formatted(), "0 B/s");
    }

    #[test]
    fn sample_after_window_reports_rate() {
        let tracker = DownloadSpeedTracker::new();
        std::thread::sleep(MIN_SAMPLE_INTERVAL + Duration::from_millis(50));
        tracker.report_bytes(10_240);
        let speed = tracker.get_speed_bytes_per_second();
        assert!(speed > 0.0, "expected positive speed, got {speed}");

        // Immediately after a sample the window applies again.
        tracker.report_bytes(10_240);
        assert_eq!(tracker.get_speed_bytes_per_second(), 0.0);
    }

    #[test]
    fn zero_growth_tick_formats_as_zero() {
        let tracker = DownloadSpeedTracker::new();
        std::thread::sleep(MIN_SAMPLE_INTERVAL + Duration::from_millis(50));
        assert_eq!(tracker.get_speed_formatted(), "0 B/s");
    }

    #[test]
    fn format_speed_scales_units() {
        assert_eq!(format_speed(0.0), "0 B/s");
        assert_eq!(format_speed(512.0), "512 B/s");
        assert_eq!(format_speed(2048.0), "2.0 KiB/s");
        assert_eq!(format_speed(3.5 * 1024.0 * 1024.0), "3.5 MiB/s");
    }

    #[test]
    fn monitoring_emits_and_stops() {
        let tracker = DownloadSpeedTracker::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&ticks);
        tracker.subscribe(Arc::new(move |report: &String| {
            assert!(!report.is_empty());
            t.fetch_add(1, Ordering::Relaxed);
        }));

        tracker.start_monitoring(Duration::from_millis(20));
        // Second start while active is a no-op.
        tracker.start_monitoring(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(90));
        tracker.stop_monitoring();

        let seen = ticks.load(Ordering::Relaxed);
        assert!(seen >= 1, "sampler never ticked");
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(ticks.load(Ordering::Relaxed), seen, "tick after stop");
    }
}

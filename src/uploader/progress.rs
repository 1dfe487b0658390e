//! Progress reporting for uploads: byte-accurate tracking from the
//! received-chunk set, sliding-window speed calculation, and throttled
//! callbacks with forced boundary events.

use std::fmt::{Debug, Formatter};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Upload phases reported at boundary events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Fingerprinting,
    Initializing,
    Transferring,
    Retrying,
    Completing,
    Done,
}

/// Progress update information sent to callbacks
#[derive(Clone)]
pub struct ProgressUpdate {
    pub phase: UploadPhase,
    /// Total file size in bytes
    pub total_size: u64,
    /// Bytes confirmed received by the server
    pub uploaded: u64,
    /// Progress percentage (0.0 - 1.0)
    pub progress: f64,
    /// Current upload speed in bytes per second
    pub speed_bytes_per_sec: u64,
    /// Estimated time remaining in seconds (None if speed is 0)
    pub eta_seconds: Option<u64>,
    /// Total number of chunks
    pub total_chunks: usize,
    /// Completed chunk count
    pub completed_chunks: usize,
}

impl Debug for ProgressUpdate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{:?}] {:.1}% ({} / {}) @ {} | ETA: {} | Chunks: {}/{}",
            self.phase,
            self.progress * 100.0,
            format_bytes(self.uploaded),
            format_bytes(self.total_size),
            format_speed(self.speed_bytes_per_sec),
            format_eta(self.eta_seconds),
            self.completed_chunks,
            self.total_chunks,
        )
    }
}

/// Format bytes into human-readable string (e.g., "10.5 MB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format speed into human-readable string (e.g., "10.5 MB/s")
pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec))
}

/// Format ETA into human-readable string (e.g., "2m 30s")
pub fn format_eta(eta_seconds: Option<u64>) -> String {
    match eta_seconds {
        None => "N/A".to_string(),
        Some(0) => "0s".to_string(),
        Some(secs) => {
            let hours = secs / 3600;
            let minutes = (secs % 3600) / 60;
            let seconds = secs % 60;

            if hours > 0 {
                format!("{}h {}m {}s", hours, minutes, seconds)
            } else if minutes > 0 {
                format!("{}m {}s", minutes, seconds)
            } else {
                format!("{}s", seconds)
            }
        }
    }
}

/// Trait for receiving progress updates
pub trait ProgressCallback: Send + Sync {
    /// Called when upload progress changes
    fn on_progress(&self, update: ProgressUpdate);
}

/// No-op progress callback implementation
pub struct NoOpProgress;

impl ProgressCallback for NoOpProgress {
    fn on_progress(&self, _update: ProgressUpdate) {}
}

/// Closure-based progress callback
pub struct FnProgress<F>(pub F);

impl<F> ProgressCallback for FnProgress<F>
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    fn on_progress(&self, update: ProgressUpdate) {
        (self.0)(update)
    }
}

impl<T: ProgressCallback> ProgressCallback for std::sync::Arc<T> {
    fn on_progress(&self, update: ProgressUpdate) {
        (**self).on_progress(update)
    }
}

/// Speed calculator using a sliding window for stable measurements
struct SpeedCalculator {
    samples: Vec<(Instant, u64)>,
    window_duration: Duration,
}

impl SpeedCalculator {
    fn new() -> Self {
        Self {
            samples: Vec::with_capacity(32),
            window_duration: Duration::from_secs(10),
        }
    }

    /// Record a sample and calculate current speed
    fn record_and_calculate(&mut self, total_bytes: u64) -> u64 {
        let now = Instant::now();
        self.samples.push((now, total_bytes));

        let cutoff = now - self.window_duration;
        self.samples.retain(|(t, _)| *t >= cutoff);

        if self.samples.len() >= 2 {
            let (oldest_time, oldest_bytes) = self.samples[0];
            let elapsed = now.duration_since(oldest_time);
            if elapsed.as_millis() > 0 {
                let bytes_diff = total_bytes.saturating_sub(oldest_bytes);
                return (bytes_diff as f64 / elapsed.as_secs_f64()) as u64;
            }
        }

        0
    }
}

/// Thread-safe progress tracker for concurrent chunk uploads.
///
/// The uploaded byte count is derived from the confirmed received set, not
/// from in-flight stream positions, so a failed attempt never inflates the
/// reported bytes. Reports are throttled; boundary events bypass the
/// throttle.
pub struct ProgressTracker {
    total_size: u64,
    total_chunks: usize,
    uploaded_bytes: AtomicU64,
    completed_chunks: AtomicU64,
    speed_calc: Mutex<SpeedCalculator>,
    last_emit: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl ProgressTracker {
    pub fn new(total_size: u64, total_chunks: usize, min_interval: Duration) -> Self {
        Self {
            total_size,
            total_chunks,
            uploaded_bytes: AtomicU64::new(0),
            completed_chunks: AtomicU64::new(0),
            speed_calc: Mutex::new(SpeedCalculator::new()),
            last_emit: Mutex::new(None),
            min_interval,
        }
    }

    /// Replace the confirmed totals (bytes and chunk count from the
    /// received set)
    pub fn set_confirmed(&self, bytes: u64, chunks: usize) {
        self.uploaded_bytes.store(bytes, Ordering::SeqCst);
        self.completed_chunks.store(chunks as u64, Ordering::SeqCst);
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded_bytes.load(Ordering::SeqCst)
    }

    /// Build an update for the current state
    pub fn create_update(&self, phase: UploadPhase) -> ProgressUpdate {
        let uploaded = self.uploaded();
        let speed = self
            .speed_calc
            .lock()
            .expect("speed calculator poisoned")
            .record_and_calculate(uploaded);

        let progress = if self.total_size > 0 {
            (uploaded as f64 / self.total_size as f64).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let eta_seconds = if speed > 0 && uploaded < self.total_size {
            Some((self.total_size - uploaded) / speed)
        } else {
            None
        };

        ProgressUpdate {
            phase,
            total_size: self.total_size,
            uploaded,
            progress,
            speed_bytes_per_sec: speed,
            eta_seconds,
            total_chunks: self.total_chunks,
            completed_chunks: self.completed_chunks.load(Ordering::SeqCst) as usize,
        }
    }

    /// Report to the callback. Sampled reports respect the minimum
    /// interval; boundary reports (`force`) always go out.
    pub fn emit<P: ProgressCallback + ?Sized>(&self, callback: &P, phase: UploadPhase, force: bool) {
        {
            let mut last_emit = self.last_emit.lock().expect("emit clock poisoned");
            let now = Instant::now();
            if !force {
                if let Some(last) = *last_emit {
                    if now.duration_since(last) < self.min_interval {
                        return;
                    }
                }
            }
            *last_emit = Some(now);
        }
        callback.on_progress(self.create_update(phase));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn format_helpers() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.00 MB");
        assert_eq!(format_eta(None), "N/A");
        assert_eq!(format_eta(Some(150)), "2m 30s");
        assert_eq!(format_eta(Some(3700)), "1h 1m 40s");
    }

    #[test]
    fn update_reflects_confirmed_bytes() {
        let tracker = ProgressTracker::new(100, 4, Duration::from_millis(0));
        tracker.set_confirmed(25, 1);

        let update = tracker.create_update(UploadPhase::Transferring);
        assert_eq!(update.uploaded, 25);
        assert_eq!(update.completed_chunks, 1);
        assert!((update.progress - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn throttle_suppresses_rapid_samples_but_not_boundaries() {
        let tracker = ProgressTracker::new(100, 4, Duration::from_secs(60));
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let callback = FnProgress(move |_update| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tracker.emit(&callback, UploadPhase::Transferring, false);
        tracker.emit(&callback, UploadPhase::Transferring, false);
        tracker.emit(&callback, UploadPhase::Transferring, false);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tracker.emit(&callback, UploadPhase::Done, true);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}

//! Shared progress accounting for the frame pipeline: percent complete
//! plus an ETA derived from throughput over a recent window.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

/// Throughput window for the fps estimate.
const WINDOW_SECS: f64 = 5.0;

#[derive(Debug)]
struct ProgressInner {
    processed: u64,
    total: Option<u64>,
    samples: VecDeque<(Instant, u64)>,
}

/// Thread-safe progress tracker shared between workers and the task.
#[derive(Debug)]
pub struct ProgressTracker {
    inner: Mutex<ProgressInner>,
}

impl ProgressTracker {
    pub fn new(estimated_total: Option<u64>) -> Self {
        Self {
            inner: Mutex::new(ProgressInner {
                processed: 0,
                total: estimated_total,
                samples: VecDeque::new(),
            }),
        }
    }

    /// Record one more processed frame.
    pub fn record_processed(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.processed += 1;
            let now = Instant::now();
            let processed = inner.processed;
            inner.samples.push_back((now, processed));
            while let Some(&(t, _)) = inner.samples.front() {
                if now.duration_since(t).as_secs_f64() > WINDOW_SECS && inner.samples.len() > 2 {
                    inner.samples.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// Refine the total once the decoder knows the true frame count.
    pub fn set_total(&self, total: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.total = Some(total);
        }
    }

    pub fn processed(&self) -> u64 {
        self.inner.lock().map(|i| i.processed).unwrap_or(0)
    }

    /// Progress percent in 0-100 and the ETA in seconds, when computable.
    pub fn snapshot(&self) -> (f32, Option<f64>) {
        let Ok(inner) = self.inner.lock() else {
            return (0.0, None);
        };
        let Some(total) = inner.total.filter(|&t| t > 0) else {
            return (0.0, None);
        };

        let percent = (inner.processed as f32 / total as f32 * 100.0).min(100.0);

        let eta = match (inner.samples.front(), inner.samples.back()) {
            (Some(&(t0, c0)), Some(&(t1, c1))) if c1 > c0 => {
                let elapsed = t1.duration_since(t0).as_secs_f64();
                if elapsed > 0.0 {
                    let fps = (c1 - c0) as f64 / elapsed;
                    Some(total.saturating_sub(inner.processed) as f64 / fps)
                } else {
                    None
                }
            }
            _ => None,
        };

        (percent, eta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_tracks_processed_over_total() {
        let tracker = ProgressTracker::new(Some(200));
        for _ in 0..50 {
            tracker.record_processed();
        }
        let (percent, _) = tracker.snapshot();
        assert!((percent - 25.0).abs() < 1e-3);
    }

    #[test]
    fn percent_is_capped_at_hundred() {
        let tracker = ProgressTracker::new(Some(3));
        for _ in 0..5 {
            tracker.record_processed();
        }
        let (percent, _) = tracker.snapshot();
        assert!((percent - 100.0).abs() < 1e-3);
    }

    #[test]
    fn unknown_total_means_no_percent_or_eta() {
        let tracker = ProgressTracker::new(None);
        tracker.record_processed();
        let (percent, eta) = tracker.snapshot();
        assert_eq!(percent, 0.0);
        assert!(eta.is_none());

        tracker.set_total(10);
        let (percent, _) = tracker.snapshot();
        assert!(percent > 0.0);
    }

    #[test]
    fn eta_appears_once_throughput_is_measurable() {
        let tracker = ProgressTracker::new(Some(100));
        tracker.record_processed();
        std::thread::sleep(std::time::Duration::from_millis(20));
        tracker.record_processed();
        let (_, eta) = tracker.snapshot();
        let eta = eta.expect("two spaced samples give an fps estimate");
        assert!(eta > 0.0);
    }
}

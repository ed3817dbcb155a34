// Batch progress snapshots and the decaying throughput estimate.

use std::time::{Duration, Instant};

/// Weight of the newest sample in the throughput average.
const SPEED_SMOOTHING: f64 = 0.3;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadProgress {
    pub total_count: usize,
    pub completed_count: usize,
    pub total_bytes: u64,
    /// Completed files at full size plus bytes received by in-flight transfers.
    pub downloaded_bytes: u64,
    pub current_file: String,
    /// Bytes per second.
    pub speed: f64,
}

impl DownloadProgress {
    pub fn ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            if self.total_count == 0 || self.completed_count >= self.total_count {
                1.0
            } else {
                0.0
            }
        } else {
            (self.downloaded_bytes as f64 / self.total_bytes as f64).min(1.0)
        }
    }

    pub fn is_done(&self) -> bool {
        self.completed_count >= self.total_count
    }
}

/// Exponentially smoothed download speed, resampled at most once per interval.
pub struct ThroughputMeter {
    min_interval: Duration,
    last_at: Instant,
    last_bytes: u64,
    speed: f64,
}

impl ThroughputMeter {
    pub fn new(min_interval: Duration, now: Instant) -> Self {
        Self {
            min_interval,
            last_at: now,
            last_bytes: 0,
            speed: 0.0,
        }
    }

    /// Feed the running byte total; returns the current estimate.
    pub fn update(&mut self, total_bytes: u64, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_at);
        if elapsed < self.min_interval {
            return self.speed;
        }

        // A restarted transfer can shrink the total; treat that as no progress.
        let delta = total_bytes.saturating_sub(self.last_bytes);
        let sample = delta as f64 / elapsed.as_secs_f64();
        self.speed = if self.speed == 0.0 {
            sample
        } else {
            SPEED_SMOOTHING * sample + (1.0 - SPEED_SMOOTHING) * self.speed
        };

        self.last_at = now;
        self.last_bytes = total_bytes;
        self.speed
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meter_samples_once_per_interval() {
        let start = Instant::now();
        let mut meter = ThroughputMeter::new(Duration::from_secs(1), start);

        assert_eq!(meter.update(500, start + Duration::from_millis(400)), 0.0);
        assert_eq!(meter.update(1000, start + Duration::from_secs(1)), 1000.0);

        // 3000 bytes over the next second: 0.3 * 3000 + 0.7 * 1000
        let speed = meter.update(4000, start + Duration::from_secs(2));
        assert!((speed - 1600.0).abs() < 1e-6);
    }

    #[test]
    fn test_shrinking_total_reads_as_idle() {
        let start = Instant::now();
        let mut meter = ThroughputMeter::new(Duration::from_secs(1), start);
        meter.update(2000, start + Duration::from_secs(1));
        let speed = meter.update(100, start + Duration::from_secs(2));
        assert!((speed - 1400.0).abs() < 1e-6);
    }

    #[test]
    fn test_ratio() {
        let progress = DownloadProgress {
            total_count: 2,
            completed_count: 1,
            total_bytes: 400,
            downloaded_bytes: 100,
            ..Default::default()
        };
        assert!((progress.ratio() - 0.25).abs() < f64::EPSILON);
        assert!(DownloadProgress::default().is_done());
        assert_eq!(DownloadProgress::default().ratio(), 1.0);
    }
}

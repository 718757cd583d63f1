use std::time::{Duration, Instant};

use serde::{Serialize, Deserialize};

/// Minimum wall-clock time between two emitted samples
pub const EMIT_INTERVAL: Duration = Duration::from_millis(1500);

/// Telemetry emitted at most once per [`EMIT_INTERVAL`]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SpeedSample {
    /// Download throughput in megabits per second
    pub mbps: f64,
    /// Smoothed ratio of recorded media time to wall-clock time
    pub percentage: f64,
}

/// Download throughput and recording-progress tracker for one attempt
#[derive(Debug)]
pub struct SpeedTracker {
    last_emit: Instant,
    accumulated_bytes: u64,
    last_timestamp_ms: i64,
    current: SpeedSample,
}

impl SpeedTracker {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(now: Instant) -> Self {
        Self {
            last_emit: now,
            accumulated_bytes: 0,
            last_timestamp_ms: 0,
            current: SpeedSample::default(),
        }
    }

    /// Record a read of `bytes_read`; `max_timestamp_ms` is the processor's
    /// highest recorded media timestamp.
    pub fn update(&mut self, bytes_read: usize, max_timestamp_ms: i64) -> Option<SpeedSample> {
        self.update_at(bytes_read, max_timestamp_ms, Instant::now())
    }

    pub fn update_at(
        &mut self,
        bytes_read: usize,
        max_timestamp_ms: i64,
        now: Instant,
    ) -> Option<SpeedSample> {
        self.accumulated_bytes += bytes_read as u64;

        let elapsed = now.saturating_duration_since(self.last_emit);
        if elapsed < EMIT_INTERVAL {
            return None;
        }

        let seconds = elapsed.as_secs_f64();
        let recorded_delta = (max_timestamp_ms - self.last_timestamp_ms) as f64;

        self.current = SpeedSample {
            mbps: self.accumulated_bytes as f64 * 8.0 / 1_000_000.0 / seconds,
            percentage: 0.5 * self.current.percentage + 0.5 * (recorded_delta / seconds / 1000.0),
        };
        self.accumulated_bytes = 0;
        self.last_timestamp_ms = max_timestamp_ms;
        self.last_emit = now;

        Some(self.current)
    }

    pub fn current(&self) -> SpeedSample {
        self.current
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}

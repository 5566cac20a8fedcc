//! Network-synchronized time source
//!
//! Connection timestamps are taken from a [`NetworkClock`] rather than the
//! local wall clock so uptime accounting agrees across peers.
//! [`MedianClock`] corrects the local clock by the median of observed peer
//! drifts, moving at most 5 ms per sample and never running backwards.

use parking_lot::Mutex;

/// Maximum allowed adjustment per sample (±5 ms)
const MAX_DRIFT_US: i64 = 5_000;

/// Samples further than this from local time are ignored (±10 s)
const MAX_SAMPLE_DRIFT_US: i64 = 10_000_000;

/// Median window size (number of peer samples kept)
const MEDIAN_WINDOW: usize = 21;

/// Source of network time in microseconds since the UNIX epoch.
pub trait NetworkClock: Send + Sync {
    fn now_us(&self) -> i64;
}

/// Plain wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl NetworkClock for SystemClock {
    fn now_us(&self) -> i64 {
        chrono::Utc::now().timestamp_micros()
    }
}

#[derive(Debug, Default)]
struct ClockState {
    last_time_us: i64,
    base_offset_us: i64,
    drift_samples: Vec<i64>,
}

/// Monotonic clock corrected by peer time samples
#[derive(Debug, Default)]
pub struct MedianClock {
    state: Mutex<ClockState>,
}

fn median(mut samples: Vec<i64>) -> i64 {
    if samples.is_empty() {
        return 0;
    }
    samples.sort_unstable();
    let mid = samples.len() / 2;
    if samples.len() % 2 == 0 {
        (samples[mid - 1] + samples[mid]) / 2
    } else {
        samples[mid]
    }
}

fn bounded_delta(target: i64, current: i64) -> i64 {
    let diff = (target as i128) - (current as i128);
    diff.clamp(-(MAX_DRIFT_US as i128), MAX_DRIFT_US as i128) as i64
}

impl MedianClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a timestamp reported by a peer.
    pub fn ingest_sample(&self, peer_time_us: i64) {
        let local = SystemClock.now_us();
        let drift = peer_time_us.saturating_sub(local);
        if drift.abs() > MAX_SAMPLE_DRIFT_US {
            return;
        }

        let mut state = self.state.lock();
        state.drift_samples.push(drift);
        if state.drift_samples.len() > MEDIAN_WINDOW {
            state.drift_samples.remove(0);
        }

        let target = median(state.drift_samples.clone());
        let delta = bounded_delta(target, state.base_offset_us);
        state.base_offset_us = state.base_offset_us.saturating_add(delta);
    }

    /// Current correction applied to the local clock.
    pub fn offset_us(&self) -> i64 {
        self.state.lock().base_offset_us
    }

    pub fn sample_count(&self) -> usize {
        self.state.lock().drift_samples.len()
    }
}

impl NetworkClock for MedianClock {
    fn now_us(&self) -> i64 {
        let local = SystemClock.now_us();
        let mut state = self.state.lock();
        let mut candidate = local.saturating_add(state.base_offset_us).max(0);
        if candidate <= state.last_time_us {
            candidate = state.last_time_us.saturating_add(1);
        }
        state.last_time_us = candidate;
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readings_never_move_backwards() {
        let clock = MedianClock::new();
        let readings: Vec<i64> = (0..50).map(|_| clock.now_us()).collect();
        for window in readings.windows(2) {
            assert!(window[1] > window[0]);
        }
    }

    #[test]
    fn correction_is_bounded_per_sample() {
        let clock = MedianClock::new();
        clock.ingest_sample(SystemClock.now_us() + 2_000_000);
        assert!(clock.offset_us() <= MAX_DRIFT_US);
        assert!(clock.offset_us() > 0);
        assert_eq!(clock.sample_count(), 1);
    }

    #[test]
    fn outliers_are_ignored() {
        let clock = MedianClock::new();
        clock.ingest_sample(SystemClock.now_us() + 60_000_000);
        clock.ingest_sample(SystemClock.now_us() - 60_000_000);
        assert_eq!(clock.sample_count(), 0);
        assert_eq!(clock.offset_us(), 0);
    }

    #[test]
    fn window_keeps_most_recent_samples() {
        let clock = MedianClock::new();
        for _ in 0..(MEDIAN_WINDOW + 5) {
            clock.ingest_sample(SystemClock.now_us());
        }
        assert_eq!(clock.sample_count(), MEDIAN_WINDOW);
    }

    #[test]
    fn median_of_even_and_odd_windows() {
        assert_eq!(median(vec![3, 1, 2]), 2);
        assert_eq!(median(vec![4, 1, 3, 2]), 2);
        assert_eq!(median(Vec::new()), 0);
    }
}

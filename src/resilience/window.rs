//! Sliding windows for circuit-breaker metrics.
//!
//! # Responsibilities
//! - Keep a bounded history of call outcomes
//! - Provide failure-rate and slow-call-rate snapshots
//!
//! # Design Decisions
//! - Running aggregates are updated on every record, so a snapshot never
//!   rescans the history
//! - The time-based window uses one bucket per second and evicts stale
//!   buckets lazily, on both record and snapshot
//! - Windows are not synchronized; the owning breaker serializes access

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Which kind of window a breaker aggregates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlidingWindowType {
    #[default]
    CountBased,
    TimeBased,
}

/// A single recorded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    pub failed: bool,
    pub slow: bool,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Totals {
    calls: u32,
    failed: u32,
    slow: u32,
    slow_failed: u32,
    duration: Duration,
}

impl Totals {
    fn add(&mut self, m: &Measurement) {
        self.calls += 1;
        self.failed += m.failed as u32;
        self.slow += m.slow as u32;
        self.slow_failed += (m.slow && m.failed) as u32;
        self.duration = self.duration.saturating_add(m.duration);
    }

    fn subtract(&mut self, other: &Totals) {
        self.calls -= other.calls;
        self.failed -= other.failed;
        self.slow -= other.slow;
        self.slow_failed -= other.slow_failed;
        self.duration = self.duration.saturating_sub(other.duration);
    }
}

/// Point-in-time view of a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub total_calls: u32,
    pub failed_calls: u32,
    pub slow_calls: u32,
    pub slow_failed_calls: u32,
    pub total_duration: Duration,
}

impl Snapshot {
    fn from_totals(t: &Totals) -> Self {
        Self {
            total_calls: t.calls,
            failed_calls: t.failed,
            slow_calls: t.slow,
            slow_failed_calls: t.slow_failed,
            total_duration: t.duration,
        }
    }

    pub fn successful_calls(&self) -> u32 {
        self.total_calls - self.failed_calls
    }

    /// Percentage in `[0, 100]`; `0.0` when empty.
    pub fn failure_rate(&self) -> f32 {
        percentage(self.failed_calls, self.total_calls)
    }

    pub fn slow_call_rate(&self) -> f32 {
        percentage(self.slow_calls, self.total_calls)
    }
}

fn percentage(part: u32, total: u32) -> f32 {
    if total == 0 {
        0.0
    } else {
        part as f32 * 100.0 / total as f32
    }
}

/// Ring of the last `size` outcomes.
#[derive(Debug)]
pub struct CountWindow {
    size: usize,
    ring: VecDeque<Measurement>,
    totals: Totals,
}

impl CountWindow {
    pub fn new(size: u32) -> Self {
        let size = size.max(1) as usize;
        Self {
            size,
            ring: VecDeque::with_capacity(size),
            totals: Totals::default(),
        }
    }

    pub fn record(&mut self, m: Measurement) -> Snapshot {
        if self.ring.len() == self.size {
            if let Some(evicted) = self.ring.pop_front() {
                let mut single = Totals::default();
                single.add(&evicted);
                self.totals.subtract(&single);
            }
        }
        self.totals.add(&m);
        self.ring.push_back(m);
        self.snapshot()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::from_totals(&self.totals)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    epoch: u64,
    totals: Totals,
}

/// Per-second buckets covering the last `size` seconds.
#[derive(Debug)]
pub struct TimeWindow {
    origin: Instant,
    buckets: Vec<Bucket>,
    totals: Totals,
}

impl TimeWindow {
    pub fn new(size_secs: u32) -> Self {
        Self::starting_at(size_secs, Instant::now())
    }

    pub fn starting_at(size_secs: u32, origin: Instant) -> Self {
        let size = size_secs.max(1) as usize;
        Self {
            origin,
            buckets: vec![Bucket::default(); size],
            totals: Totals::default(),
        }
    }

    pub fn record(&mut self, m: Measurement) -> Snapshot {
        self.record_at(m, Instant::now())
    }

    pub fn record_at(&mut self, m: Measurement, now: Instant) -> Snapshot {
        let epoch = self.evict(now);
        let idx = (epoch % self.buckets.len() as u64) as usize;
        self.buckets[idx].totals.add(&m);
        self.totals.add(&m);
        Snapshot::from_totals(&self.totals)
    }

    pub fn snapshot(&mut self) -> Snapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&mut self, now: Instant) -> Snapshot {
        self.evict(now);
        Snapshot::from_totals(&self.totals)
    }

    /// Drop buckets older than the window and return the current epoch.
    fn evict(&mut self, now: Instant) -> u64 {
        let epoch = now.saturating_duration_since(self.origin).as_secs();
        let size = self.buckets.len() as u64;
        for bucket in self.buckets.iter_mut() {
            if bucket.totals.calls > 0 && bucket.epoch + size <= epoch {
                self.totals.subtract(&bucket.totals);
                bucket.totals = Totals::default();
            }
        }
        // the slot for `epoch` may still hold a bucket from an older lap
        let current = &mut self.buckets[(epoch % size) as usize];
        if current.epoch != epoch {
            self.totals.subtract(&current.totals);
            *current = Bucket {
                epoch,
                totals: Totals::default(),
            };
        }
        epoch
    }
}

/// Either kind of window behind one interface.
#[derive(Debug)]
pub enum SlidingWindow {
    Count(CountWindow),
    Time(TimeWindow),
}

impl SlidingWindow {
    pub fn new(kind: SlidingWindowType, size: u32) -> Self {
        match kind {
            SlidingWindowType::CountBased => SlidingWindow::Count(CountWindow::new(size)),
            SlidingWindowType::TimeBased => SlidingWindow::Time(TimeWindow::new(size)),
        }
    }

    pub fn record(&mut self, m: Measurement) -> Snapshot {
        match self {
            SlidingWindow::Count(w) => w.record(m),
            SlidingWindow::Time(w) => w.record(m),
        }
    }

    pub fn snapshot(&mut self) -> Snapshot {
        match self {
            SlidingWindow::Count(w) => w.snapshot(),
            SlidingWindow::Time(w) => w.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok() -> Measurement {
        Measurement {
            failed: false,
            slow: false,
            duration: Duration::from_millis(10),
        }
    }

    fn failed() -> Measurement {
        Measurement {
            failed: true,
            ..ok()
        }
    }

    fn slow() -> Measurement {
        Measurement {
            slow: true,
            duration: Duration::from_secs(3),
            ..ok()
        }
    }

    #[test]
    fn test_count_window_is_bounded() {
        let mut w = CountWindow::new(5);
        for _ in 0..4 {
            w.record(failed());
        }
        for _ in 0..10 {
            w.record(ok());
        }
        assert_eq!(w.len(), 5);
        let snap = w.snapshot();
        assert_eq!(snap.total_calls, 5);
        assert_eq!(snap.failed_calls, 0);
    }

    #[test]
    fn test_count_window_rates() {
        let mut w = CountWindow::new(5);
        w.record(failed());
        w.record(failed());
        w.record(failed());
        w.record(ok());
        let snap = w.record(slow());
        assert_eq!(snap.total_calls, 5);
        assert_eq!(snap.failure_rate(), 60.0);
        assert_eq!(snap.slow_call_rate(), 20.0);
        assert_eq!(snap.successful_calls(), 2);
    }

    #[test]
    fn test_empty_snapshot_rates_are_zero() {
        let snap = Snapshot::default();
        assert_eq!(snap.failure_rate(), 0.0);
        assert_eq!(snap.slow_call_rate(), 0.0);
    }

    #[test]
    fn test_time_window_evicts_expired_buckets() {
        let origin = Instant::now();
        let mut w = TimeWindow::starting_at(3, origin);

        w.record_at(failed(), origin);
        w.record_at(failed(), origin + Duration::from_millis(1500));
        w.record_at(ok(), origin + Duration::from_millis(2500));
        assert_eq!(w.snapshot_at(origin + Duration::from_millis(2900)).total_calls, 3);

        // second 0 leaves the window at t=3s
        let snap = w.snapshot_at(origin + Duration::from_millis(3100));
        assert_eq!(snap.total_calls, 2);
        assert_eq!(snap.failed_calls, 1);

        // everything is gone after a long pause
        let snap = w.snapshot_at(origin + Duration::from_secs(60));
        assert_eq!(snap, Snapshot::default());
    }

    #[test]
    fn test_time_window_reuses_slot_after_wraparound() {
        let origin = Instant::now();
        let mut w = TimeWindow::starting_at(2, origin);
        w.record_at(failed(), origin);
        // epoch 2 maps onto the slot of epoch 0
        let snap = w.record_at(ok(), origin + Duration::from_secs(2));
        assert_eq!(snap.total_calls, 1);
        assert_eq!(snap.failed_calls, 0);
    }

    #[test]
    fn test_sliding_window_dispatch() {
        let mut w = SlidingWindow::new(SlidingWindowType::CountBased, 2);
        w.record(failed());
        w.record(ok());
        w.record(ok());
        assert_eq!(w.snapshot().failed_calls, 0);
    }
}

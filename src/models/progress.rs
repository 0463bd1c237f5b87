use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// What a throttled progress tick carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub received_bytes: u64,
    pub bytes_per_second: u64,
    /// Zero when either the total or the rate is unknown.
    pub remaining_ms: u64,
}

/// Smoothed throughput over the last few measurement intervals, plus the tick
/// throttle that decides when an interval closes.
#[derive(Debug)]
pub struct ThroughputWindow {
    capacity: usize,
    interval: Duration,
    samples: VecDeque<(u64, Duration)>,
    pending_bytes: u64,
    last_tick: Option<Instant>,
}

impl ThroughputWindow {
    pub fn new(capacity: usize, interval: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            interval,
            samples: VecDeque::with_capacity(capacity.max(1)),
            pending_bytes: 0,
            last_tick: None,
        }
    }

    /// Accounts for `bytes` just read and returns a snapshot when a tick is due.
    ///
    /// The first call always ticks; later calls tick only once `interval` has
    /// passed since the previous tick.
    pub fn record(
        &mut self,
        bytes: u64,
        received_bytes: u64,
        total_bytes: u64,
        now: Instant,
    ) -> Option<ProgressSnapshot> {
        self.pending_bytes += bytes;

        let elapsed = match self.last_tick {
            None => None,
            Some(last) => {
                let elapsed = now.saturating_duration_since(last);
                if elapsed < self.interval {
                    return None;
                }
                Some(elapsed)
            }
        };

        if let Some(elapsed) = elapsed {
            if self.samples.len() == self.capacity {
                self.samples.pop_front();
            }
            self.samples.push_back((self.pending_bytes, elapsed));
        }
        self.pending_bytes = 0;
        self.last_tick = Some(now);

        let bytes_per_second = self.bytes_per_second();
        Some(ProgressSnapshot {
            received_bytes,
            bytes_per_second,
            remaining_ms: remaining_ms(received_bytes, total_bytes, bytes_per_second),
        })
    }

    pub fn bytes_per_second(&self) -> u64 {
        let bytes: u64 = self.samples.iter().map(|(bytes, _)| bytes).sum();
        let elapsed: Duration = self.samples.iter().map(|(_, elapsed)| *elapsed).sum();
        let millis = elapsed.as_millis();
        if millis == 0 {
            return 0;
        }
        (u128::from(bytes) * 1000 / millis) as u64
    }
}

#[must_use]
pub fn remaining_ms(received_bytes: u64, total_bytes: u64, bytes_per_second: u64) -> u64 {
    if total_bytes == 0 || bytes_per_second == 0 {
        return 0;
    }
    let remaining = total_bytes.saturating_sub(received_bytes);
    (u128::from(remaining) * 1000 / u128::from(bytes_per_second)) as u64
}

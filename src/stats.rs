use std::time::{Duration, Instant};

use crate::payload::Verdict;

/// One sealed measurement window. Plain data once sealed; the persistence
/// sink takes ownership and nothing mutates it afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundRecord {
    pub round: u32,
    pub packets: u64,
    pub duration_secs: f64,
    pub throughput: f64,
    pub errors: u64,
}

/// Live snapshot of the open round for the display.
#[derive(Debug, Clone, Copy)]
pub struct RoundLive {
    pub round: u32,
    pub packets: u64,
    pub errors: u64,
    pub elapsed_secs: f64,
}

/// Accumulates one round at a time: `record` while the window is open,
/// `seal` when it closes. A fresh window opens immediately after sealing.
#[derive(Debug)]
pub struct RoundAggregator {
    round: u32,
    packets: u64,
    errors: u64,
    opened_at: Instant,
}

impl RoundAggregator {
    pub fn new() -> Self {
        Self::with_opening(Instant::now())
    }

    fn with_opening(at: Instant) -> Self {
        Self {
            round: 1,
            packets: 0,
            errors: 0,
            opened_at: at,
        }
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    /// Count one validated notification. Anything but `Verdict::Ok` also
    /// counts as an error.
    pub fn record(&mut self, verdict: Verdict) {
        self.packets += 1;
        if verdict != Verdict::Ok {
            self.errors += 1;
        }
    }

    pub fn window_elapsed(&self, window: Duration) -> bool {
        self.opened_at.elapsed() >= window
    }

    /// Close the window and open the next one. Duration is quantized to
    /// milliseconds; a window closing within the same millisecond has
    /// duration 0 and throughput 0 by definition.
    pub fn seal(&mut self) -> RoundRecord {
        self.seal_at(Instant::now())
    }

    fn seal_at(&mut self, now: Instant) -> RoundRecord {
        let duration_secs =
            now.saturating_duration_since(self.opened_at).as_millis() as f64 / 1000.0;
        let throughput = if duration_secs > 0.0 {
            self.packets as f64 / duration_secs
        } else {
            0.0
        };
        let record = RoundRecord {
            round: self.round,
            packets: self.packets,
            duration_secs,
            throughput,
            errors: self.errors,
        };
        self.round += 1;
        self.packets = 0;
        self.errors = 0;
        self.opened_at = now;
        record
    }

    pub fn live(&self) -> RoundLive {
        RoundLive {
            round: self.round,
            packets: self.packets,
            errors: self.errors,
            elapsed_secs: self.opened_at.elapsed().as_secs_f64(),
        }
    }
}

//! Loop pacing for the ingest worker.

use std::time::{Duration, Instant};

/// Sleeps out the remainder of a fixed-frequency cycle.
///
/// Rate-limited, not rate-guaranteed: a cycle that overruns its period does
/// not accumulate debt. When the loop falls more than one full period behind,
/// the baseline resets to "now" instead of trying to catch up.
#[derive(Debug)]
pub struct Rate {
    period: Duration,
    begin: Instant,
    actual: Duration,
}

impl Rate {
    /// `frequency` is cycles per second and must be positive.
    pub fn new(frequency: u32) -> Rate {
        assert!(frequency > 0, "frequency must be positive");
        Rate {
            period: Duration::from_secs(1) / frequency,
            begin: Instant::now(),
            actual: Duration::ZERO,
        }
    }

    pub fn sleep(&mut self) {
        let expected_end = self.begin + self.period;
        let now = Instant::now();
        self.actual = now.duration_since(self.begin);
        self.begin = expected_end;
        if now >= expected_end {
            // Overran the period: run the next cycle immediately. More than a
            // full extra period behind means the baseline is stale; rebase.
            if now > expected_end + self.period {
                self.begin = now;
            }
            return;
        }
        std::thread::sleep(expected_end - now);
    }

    pub fn reset(&mut self) {
        self.begin = Instant::now();
    }

    /// Duration of the last completed cycle, work included.
    pub fn cycle_time(&self) -> Duration {
        self.actual
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

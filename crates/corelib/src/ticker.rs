//! Turns elapsed time into a count of fixed-interval ticks.

/// Accepts the passage of time and reports how many intervals have passed.
#[derive(Debug, Clone)]
pub struct Ticker {
    interval_ms: u64,
    current_ms: u64,
}

impl Ticker {
    /// An `interval_ms` of 0 is treated as 1 so every elapse produces ticks.
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms: interval_ms.max(1),
            current_ms: 0,
        }
    }

    /// Elapse `ms` milliseconds and return the number of ticks that passed.
    pub fn elapse(&mut self, ms: u64) -> u64 {
        self.current_ms += ms;
        let ticks = self.current_ms / self.interval_ms;
        self.current_ms %= self.interval_ms;
        ticks
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }
}

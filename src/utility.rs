//! Utility functions
//!
//! Small helpers shared by the lock table, the heap store and the hash table.

use std::thread;

use crate::status::{AttemptResult, Restart, Status};

/// Check if a value is a power of two
#[inline]
pub const fn is_power_of_two(n: u64) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

/// Exponential backoff for restart loops.
///
/// Spins for a growing number of iterations, then starts yielding the thread.
/// Restart loops never park: a thread either makes progress or retries.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    /// Steps spent spinning before switching to `yield_now`
    const SPIN_LIMIT: u32 = 6;

    /// Create a new backoff
    pub const fn new() -> Self {
        Self { step: 0 }
    }

    /// Back off after a failed attempt
    pub fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
        } else {
            thread::yield_now();
        }
        self.step = self.step.saturating_add(1);
    }

    /// Number of times `snooze` was called
    pub fn attempts(&self) -> u32 {
        self.step
    }

    /// Reset after progress was made
    pub fn reset(&mut self) {
        self.step = 0;
    }
}

/// Run `attempt` until it stops reporting a conflict.
///
/// A fatal restart is returned as its status.
pub fn retry<T>(mut attempt: impl FnMut() -> AttemptResult<T>) -> Result<T, Status> {
    let mut backoff = Backoff::new();
    loop {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(Restart::Conflict) => backoff.snooze(),
            Err(Restart::Fatal(status)) => return Err(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_power_of_two() {
        assert!(!is_power_of_two(0));
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(2));
        assert!(!is_power_of_two(3));
        assert!(is_power_of_two(4096));
        assert!(!is_power_of_two(4095));
    }

    #[test]
    fn test_backoff_counts_and_resets() {
        let mut backoff = Backoff::new();
        for _ in 0..10 {
            backoff.snooze();
        }
        assert_eq!(backoff.attempts(), 10);
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
    }

    #[test]
    fn test_retry_until_success() {
        let mut calls = 0;
        let result = retry(|| {
            calls += 1;
            if calls < 3 {
                Err(Restart::Conflict)
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_retry_stops_on_fatal() {
        let result: Result<(), Status> = retry(|| Err(Restart::Fatal(Status::NotEnoughSpace)));
        assert_eq!(result, Err(Status::NotEnoughSpace));
    }
}

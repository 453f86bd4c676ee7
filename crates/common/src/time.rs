//! Monotonic process clock
//!
//! All timestamps in the proxy are seconds since process start, taken
//! from a monotonic source so wall-clock adjustments cannot disturb
//! slot timeouts or epoch swaps.

use once_cell::sync::Lazy;
use std::time::{Duration, Instant};

static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Seconds since process start.
///
/// The epoch latches on first use; call this once during startup so
/// every worker shares the same origin.
#[inline]
pub fn now() -> f64 {
    START.elapsed().as_secs_f64()
}

/// Sleep for a fractional number of seconds.
pub fn sleep(seconds: f64) {
    if seconds > 0.0 {
        std::thread::sleep(Duration::from_secs_f64(seconds));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_is_monotonic() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }

    #[test]
    fn sleep_advances_time() {
        let a = now();
        sleep(0.01);
        let b = now();
        assert!(b - a >= 0.01);
    }

    #[test]
    fn negative_sleep_is_a_no_op() {
        sleep(-1.0);
    }
}

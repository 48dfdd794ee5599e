use std::time::{Duration, Instant};

/// A millisecond-resolution monotonic clock, used to account for timeout
/// budgets across multiple zero-byte reads.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Monotonic(Instant);

impl Monotonic {
    pub(crate) fn now() -> Monotonic {
        Monotonic(Instant::now())
    }

    /// Milliseconds elapsed since `earlier`.
    pub(crate) fn since(&self, earlier: Monotonic) -> u64 {
        self.0.duration_since(earlier.0).as_millis() as u64
    }
}

/// Cooperative fixed-duration sleep, used for UMS polling back-off and the
/// simple-open retry loop.
pub(crate) fn sleep_ms(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_since_is_monotonic() {
        let t0 = Monotonic::now();
        sleep_ms(2);
        let t1 = Monotonic::now();
        assert!(t1.since(t0) >= 1);
        assert_eq!(t0.since(t1), 0); // saturates rather than going negative
    }
}

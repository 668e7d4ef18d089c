//! Clock abstraction, grounded on the teacher's pattern of keeping time
//! sources behind a trait (`spark-core::time::clock`) so timeout-driven
//! components can be tested without real sleeps.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> SystemTime;
}

#[derive(Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Exponential backoff with a cap, shared by the subscription supervisor
/// (§4.4) and the RPC multiplexer (§4.6).
pub fn exponential_backoff(attempt: u32, min_delay: Duration, max_delay: Duration) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    min_delay.checked_mul(factor as u32).unwrap_or(max_delay).min(max_delay)
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// A manually-advanced clock for deterministic timeout tests.
    pub struct ManualClock {
        now: Mutex<SystemTime>,
    }

    impl ManualClock {
        pub fn new(start: SystemTime) -> Arc<Self> {
            Arc::new(Self { now: Mutex::new(start) })
        }

        pub fn advance(&self, by: Duration) {
            *self.now.lock() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> SystemTime {
            *self.now.lock()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let min = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        assert_eq!(exponential_backoff(0, min, max), Duration::from_secs(1));
        assert_eq!(exponential_backoff(1, min, max), Duration::from_secs(2));
        assert_eq!(exponential_backoff(2, min, max), Duration::from_secs(4));
        assert_eq!(exponential_backoff(10, min, max), Duration::from_secs(30));
    }
}

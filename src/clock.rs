//! Wall-clock abstraction.
//!
//! Artifact expiry is stated by GitHub as unix seconds, so the cache reasons in
//! wall-clock time. Everything that compares against an expiry takes its "now"
//! from a [`Clock`] so tests can pin and advance time.

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use mock::MockClock;

#[cfg(any(test, feature = "test-support"))]
mod mock {
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    use chrono::{DateTime, Utc};

    use super::Clock;

    /// Time only moves when [`advance`](MockClock::advance) or
    /// [`set`](MockClock::set) is called.
    #[derive(Clone)]
    pub struct MockClock {
        current: Arc<Mutex<DateTime<Utc>>>,
    }

    impl MockClock {
        pub fn at(start: DateTime<Utc>) -> Self {
            Self {
                current: Arc::new(Mutex::new(start)),
            }
        }

        /// Starts at a fixed, whole-second instant.
        pub fn new() -> Self {
            Self::at(DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default())
        }

        pub fn advance(&self, by: Duration) {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            *current += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        }

        pub fn set(&self, to: DateTime<Utc>) {
            *self.current.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Default for MockClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> DateTime<Utc> {
            *self.current.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }
}

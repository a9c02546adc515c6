use chrono::{DateTime, Utc};

/// Source of wall-clock time, injected everywhere the engine needs "now"
/// instead of calling `Utc::now()` directly.
///
/// Required for deterministic retry-delay tests: a test clock can be
/// advanced by exactly the scheduled delay and the scheduler's next tick
/// observed, without a real sleep.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The production clock: wall time, nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

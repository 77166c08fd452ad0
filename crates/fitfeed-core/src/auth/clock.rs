//! Wall-clock source for expiry arithmetic.

use chrono::Utc;

/// Source of "now" in epoch milliseconds.
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> i64;
}

/// The system wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that advances with tokio's timer instead of the wall clock.
///
/// Under `tokio::time::pause` it moves only when the runtime's time does, so
/// expiry arithmetic and scheduled refreshes stay in step.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    anchor_millis: i64,
    anchor: tokio::time::Instant,
}

impl TokioClock {
    pub fn starting_at(anchor_millis: i64) -> Self {
        Self {
            anchor_millis,
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> i64 {
        self.anchor_millis + self.anchor.elapsed().as_millis() as i64
    }
}

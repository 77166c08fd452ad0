//! Proactive refresh scheduling.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

/// What to do about a token given its expiry and the refresh margin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPlan {
    /// Refresh after this delay
    At(Duration),
    /// Inside the margin but still valid: refresh right away
    Now,
    /// Already expired: the schedule was missed, end the session
    Expired,
}

pub fn plan_refresh(expires_at: i64, now_millis: i64, margin: Duration) -> RefreshPlan {
    let until_expiry = expires_at - now_millis;
    let until_refresh = until_expiry - margin.as_millis() as i64;

    if until_refresh > 0 {
        RefreshPlan::At(Duration::from_millis(until_refresh as u64))
    } else if until_expiry > 0 {
        RefreshPlan::Now
    } else {
        RefreshPlan::Expired
    }
}

/// The one armed proactive-refresh task. Dropping the handle cancels it.
#[derive(Debug)]
pub(crate) struct RefreshTimer {
    handle: JoinHandle<()>,
    fires_at: Instant,
}

impl RefreshTimer {
    pub(crate) fn new(handle: JoinHandle<()>, delay: Duration) -> Self {
        Self {
            handle,
            fires_at: Instant::now() + delay,
        }
    }

    /// Time left before the refresh fires
    pub(crate) fn remaining(&self) -> Duration {
        self.fires_at.saturating_duration_since(Instant::now())
    }
}

impl Drop for RefreshTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE_MS: i64 = 60 * 1000;
    const MARGIN: Duration = Duration::from_secs(5 * 60);

    #[test]
    fn test_plan_before_margin() {
        assert_eq!(
            plan_refresh(20 * MINUTE_MS, 0, MARGIN),
            RefreshPlan::At(Duration::from_secs(15 * 60))
        );
    }

    #[test]
    fn test_plan_inside_margin() {
        assert_eq!(plan_refresh(5 * MINUTE_MS, 0, MARGIN), RefreshPlan::Now);
        assert_eq!(plan_refresh(1, 0, MARGIN), RefreshPlan::Now);
    }

    #[test]
    fn test_plan_expired() {
        assert_eq!(plan_refresh(0, 0, MARGIN), RefreshPlan::Expired);
        assert_eq!(plan_refresh(0, MINUTE_MS, MARGIN), RefreshPlan::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_timer_cancels_task() {
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = fired.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        let timer = RefreshTimer::new(handle, Duration::from_secs(1));
        assert_eq!(timer.remaining(), Duration::from_secs(1));
        drop(timer);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!fired.load(std::sync::atomic::Ordering::SeqCst));
    }
}

//! The per-platform polling loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Outcome of one pass over every tracked feed of a platform.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub processed: usize,
    pub failed: usize,
    /// Set when the platform rate-limited the account; the loop waits at
    /// least this long before the next pass.
    pub rate_limited: Option<Duration>,
}

#[async_trait]
pub trait Checker: Send + Sync {
    fn name(&self) -> &'static str;
    fn min_interval(&self) -> Duration;
    async fn run_pass(&self) -> Result<PassReport>;
}

pub struct PollingScheduler {
    checker: Arc<dyn Checker>,
    pass_timeout: Duration,
}

impl PollingScheduler {
    pub fn new(checker: Arc<dyn Checker>, pass_timeout: Duration) -> Self {
        Self {
            checker,
            pass_timeout,
        }
    }

    /// Runs a single pass and returns how long to sleep before the next one.
    pub async fn run_once(&self) -> Duration {
        let start = Instant::now();
        let name = self.checker.name();
        let span = info_span!("pass", checker = name, pass_id = %Uuid::new_v4());

        // A panicking pass only takes down its own task.
        let checker = self.checker.clone();
        let mut pass =
            tokio::spawn(async move { checker.run_pass().await }.instrument(span.clone()));

        let mut rate_limited = None;
        match tokio::time::timeout(self.pass_timeout, &mut pass).await {
            Ok(Ok(Ok(report))) => {
                span.in_scope(|| {
                    debug!(
                        "[{}] Pass complete: {} processed, {} failed",
                        name, report.processed, report.failed
                    )
                });
                rate_limited = report.rate_limited;
            }
            Ok(Ok(Err(e))) => span.in_scope(|| error!("[{}] Pass aborted: {:#}", name, e)),
            Ok(Err(join)) => span.in_scope(|| error!("[{}] Pass task failed: {}", name, join)),
            Err(_) => {
                pass.abort();
                span.in_scope(|| {
                    warn!("[{}] Pass exceeded {:?}, abandoning it", name, self.pass_timeout)
                });
            }
        }

        let elapsed = start.elapsed();
        let mut delay = self.checker.min_interval().saturating_sub(elapsed);
        if let Some(reset) = rate_limited {
            warn!("[{}] Rate limited, sleeping {}s", name, reset.as_secs());
            delay = delay.max(reset);
        }
        delay
    }

    /// Polls forever; no error escapes the loop.
    pub async fn run_forever(self) {
        info!("[{}] Polling every {:?}", self.checker.name(), self.checker.min_interval());
        loop {
            let delay = self.run_once().await;
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Fails, panics or rate-limits according to the pass number.
    struct ScriptedChecker {
        passes: AtomicUsize,
        work: Duration,
        script: fn(usize) -> Result<PassReport>,
    }

    impl ScriptedChecker {
        fn new(work: Duration, script: fn(usize) -> Result<PassReport>) -> Arc<Self> {
            Arc::new(Self {
                passes: AtomicUsize::new(0),
                work,
                script,
            })
        }

        fn passes(&self) -> usize {
            self.passes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Checker for ScriptedChecker {
        fn name(&self) -> &'static str {
            "TEST"
        }

        fn min_interval(&self) -> Duration {
            Duration::from_secs(30)
        }

        async fn run_pass(&self) -> Result<PassReport> {
            let n = self.passes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            (self.script)(n)
        }
    }

    fn ok(_: usize) -> Result<PassReport> {
        Ok(PassReport {
            processed: 3,
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_for_the_rest_of_the_interval() {
        let checker = ScriptedChecker::new(Duration::from_secs(10), ok);
        let scheduler = PollingScheduler::new(checker, Duration::from_secs(600));
        assert_eq!(scheduler.run_once().await, Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_pass_does_not_sleep() {
        let checker = ScriptedChecker::new(Duration::from_secs(45), ok);
        let scheduler = PollingScheduler::new(checker, Duration::from_secs(600));
        assert_eq!(scheduler.run_once().await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_extends_the_sleep() {
        let checker = ScriptedChecker::new(Duration::from_secs(1), |_| {
            Ok(PassReport {
                rate_limited: Some(Duration::from_secs(60)),
                ..Default::default()
            })
        });
        let scheduler = PollingScheduler::new(checker, Duration::from_secs(600));
        assert!(scheduler.run_once().await >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_pass_delays_next_fetch_by_reset() {
        let checker = ScriptedChecker::new(Duration::ZERO, |n| {
            Ok(PassReport {
                rate_limited: (n == 0).then_some(Duration::from_secs(60)),
                ..Default::default()
            })
        });
        let scheduler = PollingScheduler::new(checker.clone(), Duration::from_secs(600));
        tokio::spawn(scheduler.run_forever());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(checker.passes(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(checker.passes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_and_panics_do_not_stop_the_loop() {
        let checker = ScriptedChecker::new(Duration::ZERO, |n| match n {
            0 => Err(anyhow::anyhow!("bulk fetch failed")),
            1 => panic!("bug in pass"),
            _ => ok(n),
        });
        let scheduler = PollingScheduler::new(checker.clone(), Duration::from_secs(600));
        tokio::spawn(scheduler.run_forever());

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(checker.passes(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_pass_is_abandoned() {
        let checker = ScriptedChecker::new(Duration::from_secs(3600), ok);
        let scheduler = PollingScheduler::new(checker, Duration::from_secs(600));
        assert_eq!(scheduler.run_once().await, Duration::ZERO);
    }
}

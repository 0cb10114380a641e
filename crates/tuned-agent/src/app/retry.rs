use core::error::Error;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::event_loop::LoopError;
use crate::domain::resync::ResyncPeriod;

#[derive(Debug, derive_more::Display)]
pub enum RetryError {
    #[display("Resync period would exceed {maximum:?} after repeated failures")]
    BackoffExceeded { maximum: Duration },
    #[display("Unrecoverable reconciliation failure")]
    Fatal,
}

impl Error for RetryError {}

/// One run of the reconciliation loop.
#[async_trait]
pub trait Attempt: Send {
    async fn run(
        &mut self,
        resync: &mut ResyncPeriod,
        token: &CancellationToken,
    ) -> Result<(), Report<LoopError>>;
}

/// Re-runs failed attempts with exponential backoff until shutdown or until the backoff
/// would pass its ceiling.
pub struct RetryWrapper {
    resync: ResyncPeriod,
    token: CancellationToken,
}

impl RetryWrapper {
    pub fn new(resync: ResyncPeriod, token: CancellationToken) -> Self {
        Self { resync, token }
    }

    pub fn resync(&self) -> &ResyncPeriod {
        &self.resync
    }

    /// # Errors
    ///
    /// - [`RetryError::Fatal`] if an attempt failed in a way retrying cannot fix
    /// - [`RetryError::BackoffExceeded`] if attempts kept failing until the ceiling
    pub async fn run<A: Attempt>(&mut self, attempt: &mut A) -> Result<(), Report<RetryError>> {
        loop {
            let Err(report) = attempt.run(&mut self.resync, &self.token).await else {
                return Ok(());
            };

            if self.token.is_cancelled() {
                info!("Termination requested, not retrying: {report:?}");
                return Ok(());
            }
            error!("Reconciliation loop failed: {report:?}");

            if report.current_context().is_fatal() {
                return Err(report.change_context(RetryError::Fatal));
            }

            let delay = match self.resync.back_off() {
                Ok(delay) => delay,
                Err(exceeded) => {
                    return Err(report
                        .change_context(RetryError::BackoffExceeded {
                            maximum: exceeded.maximum,
                        })
                        .attach_printable(format!("next period: {:?}", exceeded.attempted)));
                }
            };

            warn!("Increased resync period to {delay:?}, retrying after it");
            tokio::select! {
                _ = self.token.cancelled() => {
                    info!("Termination requested during backoff");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use tokio::time::Instant;

    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);
    const HOUR: Duration = Duration::from_secs(3600);

    /// Replays scripted results, then succeeds.
    struct ScriptedAttempt {
        results: Vec<Result<(), LoopError>>,
        periods: Vec<Duration>,
        started: Vec<Instant>,
        cancel_on_run: Option<(usize, CancellationToken)>,
    }

    impl ScriptedAttempt {
        fn new(results: Vec<Result<(), LoopError>>) -> Self {
            Self {
                results,
                periods: Vec::new(),
                started: Vec::new(),
                cancel_on_run: None,
            }
        }

        fn failing_forever() -> Self {
            Self::new((0..100).map(|_| Err(LoopError::PullFailed)).collect())
        }
    }

    #[async_trait]
    impl Attempt for ScriptedAttempt {
        async fn run(
            &mut self,
            resync: &mut ResyncPeriod,
            _token: &CancellationToken,
        ) -> Result<(), Report<LoopError>> {
            self.periods.push(resync.current());
            self.started.push(Instant::now());
            if let Some((run, token)) = &self.cancel_on_run {
                if *run == self.started.len() {
                    token.cancel();
                }
            }
            if self.results.is_empty() {
                return Ok(());
            }
            self.results.remove(0).map_err(Report::new)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_until_the_ceiling_then_gives_up() {
        let mut wrapper =
            RetryWrapper::new(ResyncPeriod::new(MINUTE, HOUR), CancellationToken::new());
        let mut attempt = ScriptedAttempt::failing_forever();

        let error = wrapper
            .run(&mut attempt)
            .await
            .expect_err("should give up");

        assert!(matches!(
            error.current_context(),
            RetryError::BackoffExceeded { .. }
        ));
        let periods: Vec<u64> = attempt.periods.iter().map(Duration::as_secs).collect();
        assert_eq!(periods, vec![60, 120, 240, 480, 960, 1920]);
        let waits: Vec<u64> = attempt
            .started
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_secs())
            .collect();
        assert_eq!(waits, vec![120, 240, 480, 960, 1920]);
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_failure_keeps_the_raised_period() {
        let mut wrapper =
            RetryWrapper::new(ResyncPeriod::new(MINUTE, HOUR), CancellationToken::new());
        let mut attempt = ScriptedAttempt::new(vec![Err(LoopError::WatchFailed), Ok(())]);

        wrapper.run(&mut attempt).await.expect("second attempt ends cleanly");

        assert_eq!(attempt.periods, vec![MINUTE, Duration::from_secs(120)]);
        assert_eq!(wrapper.resync().current(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn startup_failure_is_not_retried() {
        let mut wrapper =
            RetryWrapper::new(ResyncPeriod::new(MINUTE, HOUR), CancellationToken::new());
        let mut attempt = ScriptedAttempt::new(vec![Err(LoopError::StartupFailed)]);

        let error = wrapper.run(&mut attempt).await.expect_err("fatal");

        assert!(matches!(error.current_context(), RetryError::Fatal));
        assert_eq!(attempt.periods.len(), 1);
        assert_eq!(wrapper.resync().current(), MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_termination_exits_cleanly() {
        let token = CancellationToken::new();
        let mut wrapper = RetryWrapper::new(ResyncPeriod::new(MINUTE, HOUR), token.clone());
        let mut attempt = ScriptedAttempt::failing_forever();
        attempt.cancel_on_run = Some((2, token));

        wrapper
            .run(&mut attempt)
            .await
            .expect("termination wins over the failure");

        assert_eq!(attempt.periods.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn termination_interrupts_the_backoff_sleep() {
        let token = CancellationToken::new();
        let mut wrapper = RetryWrapper::new(ResyncPeriod::new(MINUTE, HOUR), token.clone());
        let mut attempt = ScriptedAttempt::failing_forever();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            token.cancel();
        });
        let started = Instant::now();
        wrapper.run(&mut attempt).await.expect("cancelled");

        canceller.await.expect("canceller task");
        assert_eq!(attempt.periods.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(120));
    }
}

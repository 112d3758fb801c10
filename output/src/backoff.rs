//! Backoff wrapper
//!
//! Wraps any [`NetworkClient`] and sleeps after failed connects and
//! publishes. Errors are always returned unchanged; the wrapper only
//! inserts the delay.
//!
//! Two delay schedules, both bounded by `[init, max]` and doubling per
//! failure:
//!
//! - **Exponential**: `init, 2*init, 4*init, ... max`
//! - **EqualJitter**: half of the current step plus a random share of the
//!   other half, so a fleet restarting together spreads its reconnects

use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tokio::sync::watch;
use toimitus_core::{Batch, NetworkClient, OutputError};
use tracing::debug;

/// Default first delay (1 second)
pub const DEFAULT_BACKOFF_INIT: Duration = Duration::from_secs(1);

/// Default delay cap (60 seconds)
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Delay schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffKind {
    Exponential,
    #[default]
    EqualJitter,
}

/// Bounded, resettable, interruptible delay
#[derive(Debug)]
pub struct Backoff {
    kind: BackoffKind,
    init: Duration,
    max: Duration,
    duration: Duration,
    done: Option<watch::Receiver<bool>>,
}

impl Backoff {
    pub fn new(kind: BackoffKind, init: Duration, max: Duration) -> Self {
        let max = max.max(init);
        let mut backoff = Self {
            kind,
            init,
            max,
            duration: init,
            done: None,
        };
        backoff.reset();
        backoff
    }

    pub fn exponential(init: Duration, max: Duration) -> Self {
        Self::new(BackoffKind::Exponential, init, max)
    }

    pub fn equal_jitter(init: Duration, max: Duration) -> Self {
        Self::new(BackoffKind::EqualJitter, init, max)
    }

    /// Abort waits once `done` turns true (or its sender is dropped)
    pub fn interrupt_on(mut self, done: watch::Receiver<bool>) -> Self {
        self.done = Some(done);
        self
    }

    pub fn kind(&self) -> BackoffKind {
        self.kind
    }

    /// Back to the first step
    pub fn reset(&mut self) {
        self.duration = match self.kind {
            BackoffKind::Exponential => self.init,
            // jitter waits half of `duration` at minimum
            BackoffKind::EqualJitter => self.init.saturating_mul(2),
        };
    }

    /// Delay of the next wait, advancing the schedule
    fn next_delay(&mut self) -> Duration {
        let delay = match self.kind {
            BackoffKind::Exponential => self.duration,
            BackoffKind::EqualJitter => {
                let half = self.duration / 2;
                if half.is_zero() {
                    half
                } else {
                    half + rand::thread_rng().gen_range(Duration::ZERO..half)
                }
            }
        };
        self.duration = self.duration.saturating_mul(2).min(self.max);
        delay
    }

    /// Sleep for the next step; `false` if interrupted
    pub async fn wait(&mut self) -> bool {
        let delay = self.next_delay();
        match self.done.as_mut() {
            None => {
                tokio::time::sleep(delay).await;
                true
            }
            Some(done) => {
                if *done.borrow() {
                    return false;
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => true,
                    _ = crate::raised(done) => false,
                }
            }
        }
    }
}

/// Which kind of failure the last delay was for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    Network,
    Application,
}

impl From<&OutputError> for FailureKind {
    fn from(err: &OutputError) -> Self {
        if err.is_application() {
            FailureKind::Application
        } else {
            FailureKind::Network
        }
    }
}

/// Client wrapper adding backoff delays on failure
pub struct BackoffClient<C> {
    client: C,
    backoff: Backoff,
    last_failure: Option<FailureKind>,
}

impl<C: NetworkClient> BackoffClient<C> {
    pub fn new(client: C, backoff: Backoff) -> Self {
        Self {
            client,
            backoff,
            last_failure: None,
        }
    }

    pub fn inner(&self) -> &C {
        &self.client
    }

    pub fn inner_mut(&mut self) -> &mut C {
        &mut self.client
    }

    async fn fail(&mut self, op: &'static str, err: &OutputError) {
        self.last_failure = Some(FailureKind::from(err));
        debug!(client = %self.client.name(), op, error = %err, "backing off");
        if !self.backoff.wait().await {
            debug!(client = %self.client.name(), "backoff interrupted by shutdown");
        }
    }
}

#[async_trait]
impl<C: NetworkClient> NetworkClient for BackoffClient<C> {
    fn name(&self) -> &str {
        self.client.name()
    }

    async fn connect(&mut self) -> Result<(), OutputError> {
        match self.client.connect().await {
            Ok(()) => {
                // an application-level failure outlives a reconnect
                if self.last_failure != Some(FailureKind::Application) {
                    self.backoff.reset();
                    self.last_failure = None;
                }
                Ok(())
            }
            Err(err) => {
                self.fail("connect", &err).await;
                Err(err)
            }
        }
    }

    async fn close(&mut self) -> Result<(), OutputError> {
        self.client.close().await
    }

    async fn publish(&mut self, batch: Batch) -> Result<(), OutputError> {
        match self.client.publish(batch).await {
            Ok(()) => {
                self.backoff.reset();
                self.last_failure = None;
                Ok(())
            }
            Err(err) => {
                // timeouts below the threshold keep the connection usable
                if !err.is_timeout() {
                    let _ = self.client.close().await;
                }
                self.fail("publish", &err).await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::time::Instant;
    use toimitus_core::Event;

    const INIT: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(8);

    #[test]
    fn exponential_doubles_to_max() {
        let mut backoff = Backoff::exponential(INIT, MAX);
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), INIT);
    }

    #[test]
    fn equal_jitter_stays_in_upper_half() {
        let mut backoff = Backoff::equal_jitter(INIT, MAX);
        // steps: 2s, 4s, 8s, 8s...
        let steps = [2u64, 4, 8, 8, 8];
        for step in steps {
            let delay = backoff.next_delay();
            let step = Duration::from_secs(step);
            assert!(delay >= step / 2, "{delay:?} < half of {step:?}");
            assert!(delay < step, "{delay:?} >= {step:?}");
        }
    }

    #[test]
    fn max_below_init_is_raised() {
        let mut backoff = Backoff::exponential(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sleeps_the_delay() {
        let mut backoff = Backoff::exponential(INIT, MAX);
        let started = Instant::now();
        assert!(backoff.wait().await);
        assert!(backoff.wait().await);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_interrupted_by_done() {
        let (tx, rx) = watch::channel(false);
        let mut backoff = Backoff::exponential(Duration::from_secs(100), MAX).interrupt_on(rx);

        let started = Instant::now();
        let waiter = tokio::spawn(async move { backoff.wait().await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();

        assert!(!waiter.await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(100));
    }

    /// Client failing with a scripted sequence of results
    struct ScriptedClient {
        connects: VecDeque<Result<(), OutputError>>,
        publishes: VecDeque<Result<(), OutputError>>,
        closes: usize,
    }

    impl ScriptedClient {
        fn new(
            connects: Vec<Result<(), OutputError>>,
            publishes: Vec<Result<(), OutputError>>,
        ) -> Self {
            Self {
                connects: connects.into(),
                publishes: publishes.into(),
                closes: 0,
            }
        }
    }

    #[async_trait]
    impl NetworkClient for ScriptedClient {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn connect(&mut self) -> Result<(), OutputError> {
            self.connects.pop_front().unwrap_or(Ok(()))
        }

        async fn close(&mut self) -> Result<(), OutputError> {
            self.closes += 1;
            Ok(())
        }

        async fn publish(&mut self, batch: Batch) -> Result<(), OutputError> {
            let result = self.publishes.pop_front().unwrap_or(Ok(()));
            match &result {
                Ok(()) => batch.ack(),
                Err(_) => batch.discard(),
            }
            result
        }
    }

    fn refused() -> OutputError {
        OutputError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
    }

    fn batch() -> Batch {
        Batch::new(vec![Event::default()], None)
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failures_back_off_and_return_error() {
        let inner = ScriptedClient::new(vec![Err(refused()), Err(refused()), Ok(())], vec![]);
        let mut client = BackoffClient::new(inner, Backoff::exponential(INIT, MAX));

        let started = Instant::now();
        assert!(matches!(client.connect().await, Err(OutputError::Io(_))));
        assert!(client.connect().await.is_err());
        assert_eq!(started.elapsed(), Duration::from_secs(3));

        client.connect().await.unwrap();
        // success reset the schedule
        assert_eq!(client.backoff.next_delay(), INIT);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_closes_inner_client() {
        let inner = ScriptedClient::new(vec![], vec![Err(refused())]);
        let mut client = BackoffClient::new(inner, Backoff::exponential(INIT, MAX));

        assert!(client.publish(batch()).await.is_err());
        assert_eq!(client.inner().closes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_timeout_keeps_inner_open() {
        let inner = ScriptedClient::new(
            vec![],
            vec![Err(OutputError::Timeout(Duration::from_secs(30)))],
        );
        let mut client = BackoffClient::new(inner, Backoff::exponential(INIT, MAX));

        assert!(client.publish(batch()).await.unwrap_err().is_timeout());
        assert_eq!(client.inner().closes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn application_failure_survives_reconnect() {
        let inner = ScriptedClient::new(
            vec![],
            vec![
                Err(OutputError::Application("OOM command not allowed".into())),
                Ok(()),
            ],
        );
        let mut client = BackoffClient::new(inner, Backoff::exponential(INIT, MAX));

        assert!(client.publish(batch()).await.is_err());
        client.connect().await.unwrap();
        // still on the second step
        assert_eq!(client.backoff.duration, Duration::from_secs(2));
        assert_eq!(client.last_failure, Some(FailureKind::Application));

        client.publish(batch()).await.unwrap();
        assert_eq!(client.last_failure, None);
        assert_eq!(client.backoff.duration, INIT);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_publish_resets() {
        let inner = ScriptedClient::new(vec![], vec![Err(refused()), Err(refused()), Ok(())]);
        let mut client = BackoffClient::new(inner, Backoff::exponential(INIT, MAX));

        assert!(client.publish(batch()).await.is_err());
        assert!(client.publish(batch()).await.is_err());
        client.publish(batch()).await.unwrap();
        assert_eq!(client.backoff.next_delay(), INIT);
    }
}

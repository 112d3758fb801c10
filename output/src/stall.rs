//! Stall listener - watchdog over an in-flight batch
//!
//! Runs next to a publish and expects acknowledgement progress at least
//! once per timeout. Each `ack(n)` with `n > 0` restarts the timer. When the
//! timer fires the configured [`StallPolicy`] decides what happens:
//!
//! - `Rehandback`: the owner is notified through the expiry channel and
//!   hands the unacknowledged suffix back for another path to pick up
//! - `AlertOnly`: an operator-facing error is logged and the batch is left
//!   to the sink's own recovery
//!
//! Either way the listener stops after the first expiry. `ack` never blocks
//! once the listener is gone.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// What to do when a batch makes no progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StallPolicy {
    /// Hand the unacknowledged events back for retry elsewhere
    Rehandback,
    /// Only report the stall
    #[default]
    AlertOnly,
}

impl fmt::Display for StallPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StallPolicy::Rehandback => f.write_str("rehandback"),
            StallPolicy::AlertOnly => f.write_str("alert"),
        }
    }
}

impl FromStr for StallPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rehandback" | "resend" | "retry" => Ok(StallPolicy::Rehandback),
            "alert" | "alert-only" | "alertonly" => Ok(StallPolicy::AlertOnly),
            other => Err(format!("unknown stall policy '{other}'")),
        }
    }
}

/// Handle on a running watchdog task
///
/// Dropping the handle stops the task.
#[derive(Debug)]
pub struct StallListener {
    ack_tx: mpsc::Sender<usize>,
    done: watch::Receiver<bool>,
    expiry: Option<oneshot::Receiver<()>>,
    shutdown: oneshot::Sender<()>,
}

impl StallListener {
    /// Start watching; `None` when `timeout` is zero (detection disabled)
    pub fn spawn(timeout: Duration, policy: StallPolicy, label: impl Into<String>) -> Option<Self> {
        if timeout.is_zero() {
            return None;
        }

        let (ack_tx, ack_rx) = mpsc::channel(1);
        let (done_tx, done) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (expiry_tx, expiry_rx) = match policy {
            StallPolicy::Rehandback => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
            StallPolicy::AlertOnly => (None, None),
        };

        let label = label.into();
        tokio::spawn(async move {
            watchdog(timeout, policy, &label, ack_rx, shutdown_rx, expiry_tx).await;
            let _ = done_tx.send(true);
        });

        Some(Self {
            ack_tx,
            done,
            expiry: expiry_rx,
            shutdown: shutdown_tx,
        })
    }

    /// Report `n` newly acknowledged events
    pub async fn ack(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut done = self.done.clone();
        tokio::select! {
            _ = self.ack_tx.send(n) => {}
            _ = crate::raised(&mut done) => {}
        }
    }

    /// Fires once when the batch stalled; only present under `Rehandback`
    pub fn take_expiry(&mut self) -> Option<oneshot::Receiver<()>> {
        self.expiry.take()
    }

    /// Whether the watchdog task has exited
    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Stop watching; dropping the handle does the same
    pub fn close(self) {
        let _ = self.shutdown.send(());
    }
}

async fn watchdog(
    timeout: Duration,
    policy: StallPolicy,
    label: &str,
    mut ack_rx: mpsc::Receiver<usize>,
    mut shutdown_rx: oneshot::Receiver<()>,
    mut expiry_tx: Option<oneshot::Sender<()>>,
) {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut acked = 0usize;

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown_rx => {
                debug!(client = %label, acked, "stall listener closed");
                return;
            }

            n = ack_rx.recv() => match n {
                Some(n) => {
                    acked += n;
                    deadline.as_mut().reset(Instant::now() + timeout);
                }
                None => return,
            },

            _ = &mut deadline => {
                match policy {
                    StallPolicy::Rehandback => {
                        warn!(
                            client = %label,
                            acked,
                            timeout_secs = timeout.as_secs_f64(),
                            "no acknowledgement progress, handing batch back"
                        );
                        if let Some(tx) = expiry_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                    StallPolicy::AlertOnly => {
                        error!(
                            client = %label,
                            acked,
                            timeout_secs = timeout.as_secs_f64(),
                            "no acknowledgement progress, output may be deadlocked"
                        );
                    }
                }
                return;
            }
        }
    }
}

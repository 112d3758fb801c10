//! Acknowledgment signalers
//!
//! A [`Signaler`] tells a producer whether the events it handed over were
//! delivered. Batching merges and splits events freely, so signalers form a
//! tree:
//!
//! ```text
//!              producer waiter
//!                    │
//!               Single(tx)
//!                    │
//!              ┌─ Split(2) ─┐          one bulk call spread over two batches
//!              │            │
//!   Composite(a, child0)  Composite(child1, c)   batches carrying several calls
//! ```
//!
//! Every variant receives exactly one terminal call. Terminal operations
//! consume the signaler so a second call is a compile error rather than a
//! runtime surprise. Dropping a signaler without a terminal call counts as a
//! failure, so a lost batch is never reported as delivered.

use crate::error::SignalError;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::oneshot;

/// Outcome delivered to a producer
pub type SignalResult = Result<(), SignalError>;

/// Completion/failure capability attached to a message or batch
pub enum Signaler {
    /// Wraps a producer's wait primitive directly
    Single(oneshot::Sender<SignalResult>),
    /// One of N children fanning in to a shared parent
    Split(SplitChild),
    /// Independent signalers that all receive the same terminal call
    Composite(Vec<Signaler>),
}

impl Signaler {
    /// Create a signaler plus the waiter the producer blocks on
    pub fn single() -> (Signaler, SignalWaiter) {
        let (tx, rx) = oneshot::channel();
        (Signaler::Single(tx), SignalWaiter { rx })
    }

    /// Split this signaler into `n` children
    ///
    /// The parent is completed once every child completed, or failed as
    /// soon as the first child fails. With `n <= 1` no fan-out is needed and
    /// the signaler itself is returned as the only child.
    pub fn split(self, n: usize) -> Vec<Signaler> {
        if n <= 1 {
            return vec![self];
        }

        let shared = Arc::new(SplitState {
            parent: Mutex::new(Some(self)),
            remaining: AtomicUsize::new(n),
            failed: AtomicBool::new(false),
        });

        (0..n)
            .map(|_| {
                Signaler::Split(SplitChild {
                    shared: Some(Arc::clone(&shared)),
                })
            })
            .collect()
    }

    /// Merge signalers into one
    ///
    /// Nested composites are flattened. Returns `None` for an empty input
    /// and the signaler itself for a single input.
    pub fn composite(signalers: Vec<Signaler>) -> Option<Signaler> {
        let mut flat = Vec::with_capacity(signalers.len());
        for signaler in signalers {
            match signaler {
                Signaler::Composite(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }

        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Signaler::Composite(flat)),
        }
    }

    /// Report successful delivery
    pub fn completed(self) {
        match self {
            Signaler::Single(tx) => {
                // Receiver gone means the producer stopped waiting
                let _ = tx.send(Ok(()));
            }
            Signaler::Split(mut child) => child.completed(),
            Signaler::Composite(signalers) => {
                for signaler in signalers {
                    signaler.completed();
                }
            }
        }
    }

    /// Report failed delivery
    pub fn failed(self, cause: SignalError) {
        match self {
            Signaler::Single(tx) => {
                let _ = tx.send(Err(cause));
            }
            Signaler::Split(mut child) => child.failed(cause),
            Signaler::Composite(signalers) => {
                for signaler in signalers {
                    signaler.failed(cause.clone());
                }
            }
        }
    }
}

impl fmt::Debug for Signaler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signaler::Single(_) => f.write_str("Signaler::Single"),
            Signaler::Split(child) => f
                .debug_struct("Signaler::Split")
                .field("remaining", &child.remaining())
                .finish(),
            Signaler::Composite(inner) => f
                .debug_struct("Signaler::Composite")
                .field("len", &inner.len())
                .finish(),
        }
    }
}

/// Terminal calls on an optional signaler
///
/// Messages and batches carry `Option<Signaler>`; calling through `None`
/// is a no-op.
pub trait SignalExt {
    /// Report successful delivery
    fn completed(self);
    /// Report that delivery was given up on
    fn failed(self, cause: SignalError);
}

impl SignalExt for Option<Signaler> {
    fn completed(self) {
        if let Some(signaler) = self {
            signaler.completed();
        }
    }

    fn failed(self, cause: SignalError) {
        if let Some(signaler) = self {
            signaler.failed(cause);
        }
    }
}

/// Shared fan-in state of a split
struct SplitState {
    parent: Mutex<Option<Signaler>>,
    remaining: AtomicUsize,
    failed: AtomicBool,
}

impl SplitState {
    fn take_parent(&self) -> Option<Signaler> {
        self.parent.lock().take()
    }
}

/// One child of a split signaler
pub struct SplitChild {
    // None once a terminal call went through
    shared: Option<Arc<SplitState>>,
}

impl SplitChild {
    fn completed(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        if shared.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(parent) = shared.take_parent() {
                parent.completed();
            }
        }
    }

    fn failed(&mut self, cause: SignalError) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        // first failure wins; later failures and completions are no-ops
        if shared
            .failed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(parent) = shared.take_parent() {
                parent.failed(cause);
            }
        }
    }

    fn remaining(&self) -> usize {
        self.shared
            .as_ref()
            .map(|s| s.remaining.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

impl Drop for SplitChild {
    fn drop(&mut self) {
        if self.shared.is_some() {
            self.failed(SignalError::new("signaler dropped without notification"));
        }
    }
}

/// Producer side of a [`Signaler::Single`]
#[derive(Debug)]
pub struct SignalWaiter {
    rx: oneshot::Receiver<SignalResult>,
}

impl SignalWaiter {
    /// Wait until the events are acknowledged or given up on
    pub async fn wait(self) -> SignalResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(SignalError::new("signaler dropped without notification")),
        }
    }

    /// Non-blocking check, `None` while delivery is still pending
    pub fn try_result(&mut self) -> Option<SignalResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(SignalError::new(
                "signaler dropped without notification",
            ))),
        }
    }
}

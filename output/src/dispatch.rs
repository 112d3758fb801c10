//! Dispatcher - client workers pulling batches from a shared queue
//!
//! Each [`NetworkClient`] gets one [`ClientWorker`] task. Workers share a
//! [`WorkQueue`] holding fresh batches from the batching worker plus batches
//! handed back for another attempt. Hand-backs are always served first.
//!
//! ```text
//!                         ┌─► ClientWorker(host a) ─┐
//! BatchingWorker ──► WorkQueue                      ├─► retry ─┐
//!                    ▲    └─► ClientWorker(host b) ─┘          │
//!                    └─────────────────────────────────────────┘
//! ```
//!
//! With one failover client there is a single worker; with load balancing
//! every host has its own and they compete for batches.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc, watch};
use toimitus_core::{Batch, NetworkClient, RetryQueue, SignalError};
use tracing::{debug, info, warn};

struct QueueState {
    fresh: mpsc::Receiver<Batch>,
    retries: mpsc::UnboundedReceiver<Batch>,
    fresh_closed: bool,
}

/// Shared source of batches for client workers
///
/// Batches still waiting when the queue is dropped are failed, never
/// silently lost.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    retry: RetryQueue,
    served: AtomicU64,
}

impl WorkQueue {
    /// Wrap the batching worker's output; `max_retries = None` retries forever
    pub fn new(fresh: mpsc::Receiver<Batch>, max_retries: Option<u32>) -> Arc<Self> {
        let (retry, retries) = RetryQueue::channel(max_retries);
        Arc::new(Self {
            state: Mutex::new(QueueState {
                fresh,
                retries,
                fresh_closed: false,
            }),
            retry,
            served: AtomicU64::new(0),
        })
    }

    /// Queue batches are bound to when picked up
    pub fn retry_queue(&self) -> RetryQueue {
        self.retry.clone()
    }

    /// Number of batches handed to workers so far
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Next batch, retries first; `None` once the fresh side closed and no
    /// hand-back is waiting
    pub async fn next(&self) -> Option<Batch> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let batch = if let Ok(batch) = state.retries.try_recv() {
            Some(batch)
        } else if state.fresh_closed {
            None
        } else {
            tokio::select! {
                biased;

                batch = state.retries.recv() => batch,
                batch = state.fresh.recv() => match batch {
                    Some(batch) => Some(batch),
                    None => {
                        debug!("batch source closed");
                        state.fresh_closed = true;
                        state.retries.try_recv().ok()
                    }
                },
            }
        };

        if batch.is_some() {
            self.served.fetch_add(1, Ordering::Relaxed);
        }
        batch
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.fresh.close();

        let mut failed = 0usize;
        while let Ok(batch) = state.retries.try_recv() {
            failed += batch.len();
            batch.fail(SignalError::new("output closed with batch pending retry"));
        }
        while let Ok(batch) = state.fresh.try_recv() {
            failed += batch.len();
            batch.cancelled();
        }
        if failed > 0 {
            warn!(events = failed, "failed undelivered batches on shutdown");
        }
    }
}

/// Drives one client: connect lazily, publish, reconnect after errors
pub struct ClientWorker<C> {
    id: usize,
    client: C,
    queue: Arc<WorkQueue>,
    connected: bool,
}

impl<C: NetworkClient> ClientWorker<C> {
    pub fn new(id: usize, client: C, queue: Arc<WorkQueue>) -> Self {
        Self {
            id,
            client,
            queue,
            connected: false,
        }
    }

    /// Run until `shutdown` turns true or the queue runs dry
    ///
    /// Returns the client after closing it.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> C {
        info!(worker = self.id, client = %self.client.name(), "Client worker started");

        loop {
            let next = tokio::select! {
                biased;

                _ = crate::raised(&mut shutdown) => break,
                batch = self.queue.next() => batch,
            };
            let Some(mut batch) = next else {
                debug!(worker = self.id, "work queue drained");
                break;
            };
            batch.bind(self.queue.retry_queue());

            if !self.connected {
                // someone else may publish it while this worker connects
                batch.requeue();
                let result = tokio::select! {
                    biased;

                    _ = crate::raised(&mut shutdown) => break,
                    result = self.client.connect() => result,
                };
                match result {
                    Ok(()) => {
                        info!(worker = self.id, client = %self.client.name(), "connected");
                        self.connected = true;
                    }
                    Err(e) => {
                        warn!(
                            worker = self.id,
                            client = %self.client.name(),
                            error = %e,
                            "connect failed"
                        );
                    }
                }
                continue;
            }

            let events = batch.len();
            if let Err(e) = self.client.publish(batch).await {
                if e.is_timeout() {
                    debug!(
                        worker = self.id,
                        client = %self.client.name(),
                        events,
                        error = %e,
                        "publish timed out"
                    );
                } else {
                    warn!(
                        worker = self.id,
                        client = %self.client.name(),
                        events,
                        error = %e,
                        "publish failed, reconnecting"
                    );
                    self.connected = false;
                }
            }
        }

        #[allow(clippy::collapsible_if)]
        if self.connected {
            if let Err(e) = self.client.close().await {
                debug!(worker = self.id, error = %e, "close failed");
            }
        }
        info!(worker = self.id, client = %self.client.name(), "Client worker stopped");
        self.client
    }
}

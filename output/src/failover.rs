//! Failover wrapper
//!
//! Holds N clients with at most one active. Every `connect` moves to a
//! different candidate:
//!
//! | N   | next candidate                                  |
//! |-----|-------------------------------------------------|
//! | 0   | error, nothing configured                       |
//! | 1   | always 0                                        |
//! | 2   | the other one (ping-pong)                       |
//! | > 2 | uniformly random, never the last one attempted  |
//!
//! A candidate only becomes active once its connect succeeded. Until then
//! `publish` hands batches straight back without touching the network.

use async_trait::async_trait;
use rand::Rng;
use toimitus_core::{Batch, NetworkClient, OutputError};
use tracing::{debug, info, warn};

/// Single-active-connection group over several clients
pub struct FailoverClient<C> {
    clients: Vec<C>,
    label: String,
    active: Option<usize>,
    /// Last candidate a connect was attempted on
    cursor: Option<usize>,
}

impl<C: NetworkClient> FailoverClient<C> {
    pub fn new(clients: Vec<C>) -> Self {
        let names: Vec<&str> = clients.iter().map(|c| c.name()).collect();
        let label = format!("failover[{}]", names.join(","));
        Self {
            clients,
            label,
            active: None,
            cursor: None,
        }
    }

    /// Index of the active client
    pub fn active(&self) -> Option<usize> {
        self.active
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn clients(&self) -> &[C] {
        &self.clients
    }

    fn next_candidate(&self) -> Result<usize, OutputError> {
        let n = self.clients.len();
        match (n, self.cursor) {
            (0, _) => Err(OutputError::NoConnectionConfigured),
            (1, _) | (2, None) => Ok(0),
            (2, Some(last)) => Ok(1 - last),
            (_, None) => Ok(rand::thread_rng().gen_range(0..n)),
            (_, Some(last)) => {
                let mut rng = rand::thread_rng();
                loop {
                    let next = rng.gen_range(0..n);
                    if next != last {
                        return Ok(next);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<C: NetworkClient> NetworkClient for FailoverClient<C> {
    fn name(&self) -> &str {
        match self.active {
            Some(idx) => self.clients[idx].name(),
            None => &self.label,
        }
    }

    async fn connect(&mut self) -> Result<(), OutputError> {
        let next = self.next_candidate()?;
        self.cursor = Some(next);

        #[allow(clippy::collapsible_if)]
        if let Some(prev) = self.active.take() {
            if prev != next {
                debug!(client = %self.clients[prev].name(), "leaving active connection");
                let _ = self.clients[prev].close().await;
            }
        }

        match self.clients[next].connect().await {
            Ok(()) => {
                info!(
                    client = %self.clients[next].name(),
                    candidate = next,
                    candidates = self.clients.len(),
                    "failover connection active"
                );
                self.active = Some(next);
                Ok(())
            }
            Err(err) => {
                warn!(
                    client = %self.clients[next].name(),
                    error = %err,
                    "failover candidate failed to connect"
                );
                Err(err)
            }
        }
    }

    async fn close(&mut self) -> Result<(), OutputError> {
        match self.active.take() {
            Some(idx) => self.clients[idx].close().await,
            None => Err(OutputError::NoActiveConnection),
        }
    }

    async fn publish(&mut self, batch: Batch) -> Result<(), OutputError> {
        match self.active {
            Some(idx) => self.clients[idx].publish(batch).await,
            None => {
                batch.retry();
                Err(OutputError::NoActiveConnection)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use toimitus_core::{Event, RetryQueue};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Connect(usize),
        Close(usize),
        Publish(usize),
    }

    /// Client logging calls into a shared journal
    struct ProbeClient {
        idx: usize,
        name: String,
        journal: Arc<Mutex<Vec<Call>>>,
        /// connects fail while this counter is above zero
        failures_left: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NetworkClient for ProbeClient {
        fn name(&self) -> &str {
            &self.name
        }

        async fn connect(&mut self) -> Result<(), OutputError> {
            self.journal.lock().push(Call::Connect(self.idx));
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(OutputError::Io(std::io::Error::from(
                    std::io::ErrorKind::ConnectionRefused,
                )));
            }
            Ok(())
        }

        async fn close(&mut self) -> Result<(), OutputError> {
            self.journal.lock().push(Call::Close(self.idx));
            Ok(())
        }

        async fn publish(&mut self, batch: Batch) -> Result<(), OutputError> {
            self.journal.lock().push(Call::Publish(self.idx));
            batch.ack();
            Ok(())
        }
    }

    fn group(
        n: usize,
        failures: usize,
    ) -> (FailoverClient<ProbeClient>, Arc<Mutex<Vec<Call>>>) {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let failures_left = Arc::new(AtomicUsize::new(failures));
        let clients = (0..n)
            .map(|idx| ProbeClient {
                idx,
                name: format!("host-{idx}:5044"),
                journal: Arc::clone(&journal),
                failures_left: Arc::clone(&failures_left),
            })
            .collect();
        (FailoverClient::new(clients), journal)
    }

    fn connects(journal: &Mutex<Vec<Call>>) -> Vec<usize> {
        journal
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Connect(i) => Some(*i),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn empty_group_fails_to_connect() {
        let (mut failover, _) = group(0, 0);
        assert!(matches!(
            failover.connect().await,
            Err(OutputError::NoConnectionConfigured)
        ));
    }

    #[tokio::test]
    async fn single_client_always_selected() {
        let (mut failover, journal) = group(1, 0);
        for _ in 0..3 {
            failover.connect().await.unwrap();
        }
        assert_eq!(connects(&journal), vec![0, 0, 0]);
        // reconnecting the same client does not close it first
        assert!(!journal.lock().contains(&Call::Close(0)));
    }

    #[tokio::test]
    async fn two_clients_alternate() {
        let (mut failover, journal) = group(2, 3);
        for _ in 0..6 {
            let _ = failover.connect().await;
        }
        assert_eq!(connects(&journal), vec![0, 1, 0, 1, 0, 1]);
    }

    #[tokio::test]
    async fn many_clients_never_repeat_last_attempt() {
        let (mut failover, journal) = group(5, 40);
        for _ in 0..200 {
            let _ = failover.connect().await;
        }
        let attempts = connects(&journal);
        assert_eq!(attempts.len(), 200);
        for pair in attempts.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[tokio::test]
    async fn publish_before_any_success_hands_batch_back() {
        let (mut failover, journal) = group(3, 2);
        let (queue, mut rx) = RetryQueue::channel(None);

        assert!(failover.connect().await.is_err());
        assert!(failover.connect().await.is_err());
        assert_eq!(failover.active(), None);

        let mut batch = Batch::new(vec![Event::default(); 4], None);
        batch.bind(queue.clone());
        let err = failover.publish(batch).await.unwrap_err();
        assert!(matches!(err, OutputError::NoActiveConnection));
        let back = rx.try_recv().unwrap();
        assert_eq!(back.len(), 4);
        assert_eq!(back.attempts(), 1);
        assert!(!journal.lock().iter().any(|c| matches!(c, Call::Publish(_))));

        failover.connect().await.unwrap();
        let active = failover.active().unwrap();
        assert_eq!(failover.name(), format!("host-{active}:5044"));

        back.ack();
        let mut batch = Batch::new(vec![Event::default()], None);
        batch.bind(queue);
        failover.publish(batch).await.unwrap();
        assert_eq!(journal.lock().last(), Some(&Call::Publish(active)));
    }

    #[tokio::test]
    async fn close_only_touches_active() {
        let (mut failover, journal) = group(3, 0);
        assert!(matches!(
            failover.close().await,
            Err(OutputError::NoActiveConnection)
        ));

        failover.connect().await.unwrap();
        let active = failover.active().unwrap();
        failover.close().await.unwrap();

        let closes: Vec<Call> = journal
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::Close(_)))
            .cloned()
            .collect();
        assert_eq!(closes, vec![Call::Close(active)]);
        assert_eq!(failover.active(), None);
    }

    #[tokio::test]
    async fn switching_closes_previous_active() {
        let (mut failover, journal) = group(2, 0);
        failover.connect().await.unwrap();
        failover.connect().await.unwrap();

        assert_eq!(
            *journal.lock(),
            vec![Call::Connect(0), Call::Close(0), Call::Connect(1)]
        );
        assert_eq!(failover.active(), Some(1));
    }

    #[test]
    fn label_lists_candidates() {
        let (failover, _) = group(2, 0);
        assert_eq!(failover.name(), "failover[host-0:5044,host-1:5044]");
    }
}

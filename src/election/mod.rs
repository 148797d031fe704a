//! Leader election
//!
//! Per-namespace, lease-based primary selection over a strongly consistent
//! coordinator; the shard distributor elects one host per namespace to hand
//! out shard leases. Leadership is only as good as the session behind it:
//! the `done` channel closes when the session is lost, and callers must
//! drop any shard-distribution decisions cached under that session.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};

/// Proof of a granted lease; renewals and releases must present it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseSession {
    pub session_id: u64,
    pub host: String,
}

/// Strongly consistent lease store (etcd, consul, a CAS table)
#[async_trait]
pub trait LeaseCoordinator: Send + Sync {
    /// Try to take the namespace lease; `None` when another live session
    /// holds it
    async fn acquire(
        &self,
        namespace: &str,
        host: &str,
        ttl: Duration,
    ) -> EngineResult<Option<LeaseSession>>;

    /// Extend the lease; `false` when the session is no longer the holder
    async fn renew(&self, namespace: &str, session: &LeaseSession) -> EngineResult<bool>;

    /// Give the lease up early; a stale session is a no-op
    async fn release(&self, namespace: &str, session: &LeaseSession) -> EngineResult<()>;
}

struct HeldLease {
    session: LeaseSession,
    expires_at: Instant,
    ttl: Duration,
}

/// Single-process coordinator with real expiry semantics; the test double
/// and the single-node deployment shape
#[derive(Default)]
pub struct InMemoryCoordinator {
    leases: Mutex<HashMap<String, HeldLease>>,
    next_session_id: Mutex<u64>,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Coordinator-side session expiry (operator intervention, network
    /// partition timeout); the holder finds out at its next renewal
    pub fn revoke(&self, namespace: &str) {
        self.leases.lock().remove(namespace);
    }
}

#[async_trait]
impl LeaseCoordinator for InMemoryCoordinator {
    async fn acquire(
        &self,
        namespace: &str,
        host: &str,
        ttl: Duration,
    ) -> EngineResult<Option<LeaseSession>> {
        let mut leases = self.leases.lock();
        if let Some(held) = leases.get(namespace) {
            if held.expires_at > Instant::now() && held.session.host != host {
                return Ok(None);
            }
        }
        let session_id = {
            let mut next = self.next_session_id.lock();
            *next += 1;
            *next
        };
        let session = LeaseSession {
            session_id,
            host: host.to_string(),
        };
        leases.insert(
            namespace.to_string(),
            HeldLease {
                session: session.clone(),
                expires_at: Instant::now() + ttl,
                ttl,
            },
        );
        Ok(Some(session))
    }

    async fn renew(&self, namespace: &str, session: &LeaseSession) -> EngineResult<bool> {
        let mut leases = self.leases.lock();
        match leases.get_mut(namespace) {
            Some(held) if held.session == *session && held.expires_at > Instant::now() => {
                held.expires_at = Instant::now() + held.ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, namespace: &str, session: &LeaseSession) -> EngineResult<()> {
        let mut leases = self.leases.lock();
        if leases
            .get(namespace)
            .is_some_and(|held| held.session == *session)
        {
            leases.remove(namespace);
        }
        Ok(())
    }
}

/// Shard-distribution decisions the current leader maintains. Contents are
/// only meaningful while the owning session is alive.
#[derive(Default)]
pub struct ShardAssignmentStore {
    assignments: dashmap::DashMap<i32, String>,
}

impl ShardAssignmentStore {
    pub fn assign(&self, shard_id: i32, host: impl Into<String>) {
        self.assignments.insert(shard_id, host.into());
    }

    pub fn owner_of(&self, shard_id: i32) -> Option<String> {
        self.assignments.get(&shard_id).map(|entry| entry.clone())
    }

    /// Dropped wholesale when leadership is lost
    pub fn clear(&self) {
        self.assignments.clear();
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

/// Builds elections bound to one coordinator
pub struct ElectionFactory {
    coordinator: Arc<dyn LeaseCoordinator>,
    lease_ttl: Duration,
    retry_interval: Duration,
}

impl ElectionFactory {
    pub fn new(coordinator: Arc<dyn LeaseCoordinator>) -> Self {
        Self {
            coordinator,
            lease_ttl: Duration::from_secs(10),
            retry_interval: Duration::from_millis(500),
        }
    }

    /// Tighter timings for tests and small clusters
    pub fn with_timings(mut self, lease_ttl: Duration, retry_interval: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self.retry_interval = retry_interval;
        self
    }

    /// One election per namespace
    pub fn create_election(&self, namespace: impl Into<String>) -> Election {
        let (lost_tx, lost_rx) = watch::channel(false);
        Election {
            namespace: namespace.into(),
            coordinator: Arc::clone(&self.coordinator),
            lease_ttl: self.lease_ttl,
            retry_interval: self.retry_interval,
            shard_store: Arc::new(ShardAssignmentStore::default()),
            session: Mutex::new(None),
            lost_tx,
            lost_rx,
        }
    }
}

/// One namespace's election handle
pub struct Election {
    namespace: String,
    coordinator: Arc<dyn LeaseCoordinator>,
    lease_ttl: Duration,
    retry_interval: Duration,
    shard_store: Arc<ShardAssignmentStore>,
    session: Mutex<Option<LeaseSession>>,
    lost_tx: watch::Sender<bool>,
    lost_rx: watch::Receiver<bool>,
}

impl Election {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Block until this host holds the lease, then keep renewing it in the
    /// background. Dropping the future abandons the campaign.
    pub async fn campaign(self: Arc<Self>, host: impl Into<String>) -> EngineResult<()> {
        let host = host.into();
        let session = loop {
            match self
                .coordinator
                .acquire(&self.namespace, &host, self.lease_ttl)
                .await?
            {
                Some(session) => break session,
                None => tokio::time::sleep(self.retry_interval).await,
            }
        };
        info!(
            namespace = %self.namespace,
            host = %host,
            session_id = session.session_id,
            "leadership acquired"
        );
        *self.session.lock() = Some(session.clone());
        let _ = self.lost_tx.send(false);

        let election = Arc::clone(&self);
        tokio::spawn(async move {
            let renew_interval = election.lease_ttl / 3;
            loop {
                tokio::time::sleep(renew_interval).await;
                let Some(session) = election.session.lock().clone() else {
                    // Resigned; renewal loop is done.
                    return;
                };
                match election
                    .coordinator
                    .renew(&election.namespace, &session)
                    .await
                {
                    Ok(true) => continue,
                    Ok(false) => {
                        warn!(
                            namespace = %election.namespace,
                            "leadership session lost"
                        );
                        election.mark_lost();
                        return;
                    }
                    Err(err) => {
                        warn!(
                            namespace = %election.namespace,
                            error = %err,
                            "lease renewal failed"
                        );
                        election.mark_lost();
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    /// Step down voluntarily; closes the done channel
    pub async fn resign(&self) -> EngineResult<()> {
        let session = self.session.lock().take().ok_or_else(|| {
            EngineError::BadRequest("resign without an active campaign".into())
        })?;
        self.coordinator.release(&self.namespace, &session).await?;
        self.mark_lost();
        info!(namespace = %self.namespace, "leadership resigned");
        Ok(())
    }

    /// Resolves when the leadership session ends, for any reason. Callers
    /// must then drop shard decisions cached under the session.
    pub async fn done(&self) {
        let mut lost = self.lost_rx.clone();
        loop {
            if *lost.borrow() {
                return;
            }
            if lost.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_leader(&self) -> bool {
        self.session.lock().is_some() && !*self.lost_rx.borrow()
    }

    /// The leader's shard-distribution scratchpad
    pub fn shard_store(&self) -> Arc<ShardAssignmentStore> {
        Arc::clone(&self.shard_store)
    }

    fn mark_lost(&self) {
        *self.session.lock() = None;
        self.shard_store.clear();
        let _ = self.lost_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> ElectionFactory {
        ElectionFactory::new(Arc::new(InMemoryCoordinator::new())).with_timings(
            Duration::from_millis(100),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_campaign_acquires_leadership() {
        let election = Arc::new(factory().create_election("ns-1"));
        Arc::clone(&election).campaign("host-a").await.unwrap();
        assert!(election.is_leader());
    }

    #[tokio::test]
    async fn test_second_campaign_blocks_until_resign() {
        let factory = factory();
        let first = Arc::new(factory.create_election("ns-1"));
        let second = Arc::new(factory.create_election("ns-1"));

        Arc::clone(&first).campaign("host-a").await.unwrap();
        let contender = Arc::clone(&second);
        let handle = tokio::spawn(async move { contender.campaign("host-b").await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle.is_finished(), "contender must wait for the lease");

        first.resign().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("contender should win after resign")
            .unwrap()
            .unwrap();
        assert!(second.is_leader());
        assert!(!first.is_leader());
    }

    #[tokio::test]
    async fn test_done_closes_on_session_loss() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let factory = ElectionFactory::new(Arc::clone(&coordinator) as Arc<dyn LeaseCoordinator>)
            .with_timings(Duration::from_millis(60), Duration::from_millis(10));
        let election = Arc::new(factory.create_election("ns-1"));
        Arc::clone(&election).campaign("host-a").await.unwrap();
        election.shard_store().assign(7, "host-a");

        // Coordinator drops the session; the holder learns of it at the
        // next renewal tick.
        coordinator.revoke("ns-1");

        tokio::time::timeout(Duration::from_secs(1), election.done())
            .await
            .expect("done must close on session loss");
        assert!(!election.is_leader());
        // Decisions cached under the dead session are gone.
        assert!(election.shard_store().is_empty());
    }

    #[tokio::test]
    async fn test_resign_without_campaign_is_an_error() {
        let election = Arc::new(factory().create_election("ns-1"));
        assert!(election.resign().await.is_err());
    }

    #[tokio::test]
    async fn test_elections_are_per_namespace() {
        let factory = factory();
        let orders = Arc::new(factory.create_election("orders"));
        let billing = Arc::new(factory.create_election("billing"));
        Arc::clone(&orders).campaign("host-a").await.unwrap();
        Arc::clone(&billing).campaign("host-b").await.unwrap();
        assert!(orders.is_leader());
        assert!(billing.is_leader());
    }
}

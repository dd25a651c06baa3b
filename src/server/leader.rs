//! Deciding which replica performs distribution work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};

use crate::commons::storage::KeyValueStore;


//------------ LeaderGate ----------------------------------------------------

/// Tells a loop whether it may mutate shared state right now.
///
/// Loops must ask again after every blocking wait.
#[async_trait]
pub trait LeaderGate: Send + Sync {
    async fn is_leader(&self) -> bool;

    /// Gives up leadership, if held.
    async fn resign(&self) { }
}


//------------ AlwaysLeader --------------------------------------------------

/// The gate of a single replica deployment.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysLeader;

#[async_trait]
impl LeaderGate for AlwaysLeader {
    async fn is_leader(&self) -> bool {
        true
    }
}


//------------ SwitchLeader --------------------------------------------------

/// A gate that is flipped by hand.
#[derive(Debug)]
pub struct SwitchLeader(AtomicBool);

impl SwitchLeader {
    pub fn new(leader: bool) -> Self {
        SwitchLeader(AtomicBool::new(leader))
    }

    pub fn set(&self, leader: bool) {
        self.0.store(leader, Ordering::SeqCst)
    }
}

#[async_trait]
impl LeaderGate for SwitchLeader {
    async fn is_leader(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    async fn resign(&self) {
        self.set(false)
    }
}


//------------ LeaseLeader ---------------------------------------------------

/// Leadership through a lease in the key-value store.
///
/// The lease key holds the id of the current owner and expires unless
/// renewed. Every check renews the lease if we own it or tries to take
/// it if it has lapsed. Checks must therefore happen more often than the
/// lease expires.
#[derive(Debug)]
pub struct LeaseLeader {
    store: KeyValueStore,
    key: String,
    owner: String,
    lease: Duration,
    leading: AtomicBool,
}

impl LeaseLeader {
    pub fn new(store: KeyValueStore, key: String, lease: Duration) -> Self {
        LeaseLeader {
            store,
            key,
            owner: uuid::Uuid::new_v4().to_string(),
            lease,
            leading: AtomicBool::new(false),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    async fn check(&self) -> bool {
        match self.store.expire_if_equal(
            &self.key, &self.owner, self.lease
        ).await {
            Ok(true) => return true,
            Ok(false) => { }
            Err(e) => {
                warn!("Cannot renew leader lease {}: {e}", self.key);
                return false
            }
        }
        match self.store.set_nx(&self.key, &self.owner, self.lease).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!("Cannot acquire leader lease {}: {e}", self.key);
                false
            }
        }
    }
}

#[async_trait]
impl LeaderGate for LeaseLeader {
    async fn is_leader(&self) -> bool {
        let leader = self.check().await;
        let was = self.leading.swap(leader, Ordering::SeqCst);
        if leader != was {
            if leader {
                info!("Became leader, lease owner {}", self.owner);
            }
            else {
                info!("Lost leadership, lease owner {}", self.owner);
            }
        }
        leader
    }

    async fn resign(&self) {
        if self.leading.swap(false, Ordering::SeqCst) {
            // Only drop the key if it is still ours.
            match self.store.del_if_equal(&self.key, &self.owner).await {
                Ok(true) => {
                    info!("Resigned leadership, lease owner {}", self.owner);
                }
                Ok(false) => {
                    info!(
                        "Lease {} had already passed on, owner {}",
                        self.key, self.owner
                    );
                }
                Err(e) => {
                    warn!("Cannot release leader lease {}: {e}", self.key);
                }
            }
        }
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[tokio::test]
    async fn only_one_lease_holder() {
        let store = KeyValueStore::create(&test::mem_storage()).await.unwrap();
        let lease = Duration::from_secs(15);
        let a = LeaseLeader::new(store.clone(), "leader".into(), lease);
        let b = LeaseLeader::new(store.clone(), "leader".into(), lease);

        assert!(a.is_leader().await);
        assert!(!b.is_leader().await);
        assert!(a.is_leader().await);

        a.resign().await;
        assert!(b.is_leader().await);
        assert!(!a.is_leader().await);
    }

    #[tokio::test(start_paused = true)]
    async fn lapsed_lease_is_taken_over() {
        let store = KeyValueStore::create(&test::mem_storage()).await.unwrap();
        let lease = Duration::from_secs(2);
        let a = LeaseLeader::new(store.clone(), "leader".into(), lease);
        let b = LeaseLeader::new(store.clone(), "leader".into(), lease);

        assert!(a.is_leader().await);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(b.is_leader().await);
        assert!(!a.is_leader().await);
    }

    #[tokio::test(start_paused = true)]
    async fn resign_leaves_a_new_lease_alone() {
        let store = KeyValueStore::create(&test::mem_storage()).await.unwrap();
        let lease = Duration::from_secs(2);
        let a = LeaseLeader::new(store.clone(), "leader".into(), lease);
        let b = LeaseLeader::new(store.clone(), "leader".into(), lease);

        assert!(a.is_leader().await);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(b.is_leader().await);

        // a still believes it leads and resigns late
        a.resign().await;
        assert_eq!(
            store.get("leader").await.unwrap().as_deref(), Some(b.owner())
        );
        assert!(b.is_leader().await);
    }

    #[tokio::test]
    async fn switch() {
        let gate = SwitchLeader::new(true);
        assert!(gate.is_leader().await);
        gate.set(false);
        assert!(!gate.is_leader().await);
        assert!(AlwaysLeader.is_leader().await);
    }
}

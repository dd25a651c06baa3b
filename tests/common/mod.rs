#![allow(dead_code)] // Different tests use different parts.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::sleep;
use eventd::api::{Cursor, ResourceKind, Subscription, SubscriptionId};
use eventd::config::Config;
use eventd::server::manager::EventServer;
use eventd::server::source::{
    Change, MemoryChangeLog, MemorySubscriptionStore,
};
use eventd::server::stats::CallbackStats;
use eventd::test;


//------------ TestServer ----------------------------------------------------

/// A running pipeline on a fresh in-memory store.
pub struct TestServer {
    pub eventd: Arc<EventServer>,
    pub change_log: Arc<MemoryChangeLog>,
    pub subscriptions: Arc<MemorySubscriptionStore>,
}

impl TestServer {
    pub async fn start(subscriptions: Vec<Subscription>) -> Self {
        Self::start_with(
            Config::test(&test::mem_storage()), subscriptions
        ).await
    }

    pub async fn start_with(
        config: Config, subscriptions: Vec<Subscription>
    ) -> Self {
        let subscriptions = Arc::new(
            MemorySubscriptionStore::with_subscriptions(subscriptions)
                .unwrap()
        );
        Self::run(config, Arc::new(MemoryChangeLog::new()), subscriptions)
            .await
    }

    /// Starts a pipeline on existing collaborators, e.g. after a restart.
    pub async fn run(
        config: Config,
        change_log: Arc<MemoryChangeLog>,
        subscriptions: Arc<MemorySubscriptionStore>,
    ) -> Self {
        test::init_logging();
        let eventd = Arc::new(
            EventServer::build_standalone(
                Arc::new(config), change_log.clone(), subscriptions.clone()
            ).await.unwrap()
        );
        eventd.start().await;
        TestServer { eventd, change_log, subscriptions }
    }

    pub async fn stop(self) {
        self.eventd.shutdown().await
    }

    /// Records the creation of a host.
    pub fn create_host(&self, host_id: u64) -> Cursor {
        self.change_log.append(
            ResourceKind::Host, Change::insert(host_doc(host_id))
        )
    }

    /// Records the deletion of a host.
    pub fn delete_host(&self, host_id: u64) -> Cursor {
        self.change_log.append(
            ResourceKind::Host, Change::delete(host_doc(host_id))
        )
    }

    pub async fn stats(&self, id: SubscriptionId) -> CallbackStats {
        self.eventd.subscription_statistics(id).await.unwrap()
    }

    /// Waits until the counters of a subscription reach the given values.
    pub async fn wait_for_stats(
        &self, id: SubscriptionId, total: i64, failure: i64
    ) {
        let expected = CallbackStats { total, failure };
        for _ in 0..1000 {
            if self.stats(id).await == expected {
                return
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "statistics of subscription {id} are {:?}, expected {expected:?}",
            self.stats(id).await
        );
    }

    /// Waits until the registry reports the subscribers for an event key.
    pub async fn wait_for_subscribers(
        &self, event_key: &str, expected: &[SubscriptionId]
    ) {
        let registry = self.eventd.clone();
        test::wait_for(|| {
            registry.registry().find_subscribers(event_key) == expected
        }).await
    }
}

pub fn host_doc(host_id: u64) -> serde_json::Value {
    json!({
        "bk_host_id": host_id,
        "bk_host_innerip": format!("10.0.0.{host_id}"),
        "bk_cloud_id": 0,
    })
}

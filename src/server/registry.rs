//! The live view of all subscriptions.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::api::{Subscription, SubscriptionId};
use crate::commons::EdResult;

use super::source::{
    SourceError, SubscriptionChange, SubscriptionEvent, SubscriptionSource,
};


//------------ Registry ------------------------------------------------------

/// Maps event keys to subscribers and subscribers to their registration.
///
/// The registry only observes the subscription store. It is filled by
/// [`Registry::load`] and then kept current by [`Registry::run_watch`].
/// Readers get consistent snapshots, writes are serialized by the lock.
#[derive(Debug)]
pub struct Registry {
    state: RwLock<RegistryState>,
    ready: watch::Sender<bool>,
}

#[derive(Debug, Default)]
struct RegistryState {
    subscriptions: HashMap<SubscriptionId, Arc<Subscription>>,
    subscribers: HashMap<String, BTreeSet<SubscriptionId>>,
}

impl RegistryState {
    fn register(&mut self, key: &str, id: SubscriptionId) {
        self.subscribers.entry(key.to_string()).or_default().insert(id);
    }

    fn unregister(&mut self, key: &str, id: SubscriptionId) {
        if let Some(ids) = self.subscribers.get_mut(key) {
            ids.remove(&id);
            if ids.is_empty() {
                self.subscribers.remove(key);
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry {
            state: RwLock::new(RegistryState::default()),
            ready: watch::Sender::new(false),
        }
    }
}

// # Reading
impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the ids of all subscribers of an event key, in id order.
    pub fn find_subscribers(&self, event_key: &str) -> Vec<SubscriptionId> {
        self.state.read().expect("poisoned lock")
            .subscribers.get(event_key)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn find_subscription(
        &self, id: SubscriptionId
    ) -> Option<Arc<Subscription>> {
        self.state.read().expect("poisoned lock")
            .subscriptions.get(&id).cloned()
    }

    pub fn is_subscribed(&self, event_key: &str) -> bool {
        self.state.read().expect("poisoned lock")
            .subscribers.contains_key(event_key)
    }

    /// Returns the payload fields wanted by the subscribers of a key.
    ///
    /// Returns `None` if some subscriber wants all of them.
    pub fn wanted_fields(&self, event_key: &str) -> Option<BTreeSet<String>> {
        let state = self.state.read().expect("poisoned lock");
        let mut wanted = BTreeSet::new();
        for id in state.subscribers.get(event_key)? {
            let fields = state.subscriptions.get(id)?.field_set();
            if fields.is_empty() {
                return None
            }
            wanted.extend(fields);
        }
        Some(wanted)
    }

    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<_> = self.state.read().expect("poisoned lock")
            .subscriptions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        let mut subs: Vec<_> = self.state.read().expect("poisoned lock")
            .subscriptions.values().cloned().collect();
        subs.sort_by_key(|sub| sub.subscription_id);
        subs
    }

    pub fn len(&self) -> usize {
        self.state.read().expect("poisoned lock").subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// # Updating
impl Registry {
    /// Adds a subscription or applies changes to an existing one.
    ///
    /// Only the difference between the old and new event keys is applied.
    pub fn upsert(&self, sub: Subscription) {
        let id = sub.subscription_id;
        let new_keys = sub.event_keys();

        let mut state = self.state.write().expect("poisoned lock");
        let old_keys = state.subscriptions.get(&id)
            .map(|old| old.event_keys())
            .unwrap_or_default();

        for key in old_keys.difference(&new_keys) {
            state.unregister(key, id);
        }
        for key in new_keys.difference(&old_keys) {
            state.register(key, id);
        }
        state.subscriptions.insert(id, Arc::new(sub));
        debug!("Registered subscription {id} for {new_keys:?}");
    }

    /// Removes a subscription and all its event keys.
    pub fn remove(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        let mut state = self.state.write().expect("poisoned lock");
        let sub = state.subscriptions.remove(&id)?;
        for key in sub.event_keys() {
            state.unregister(&key, id);
        }
        debug!("Unregistered subscription {id}");
        Some(sub)
    }

    /// Replaces the content with a complete listing.
    pub fn replace_all(&self, subs: Vec<Subscription>) {
        let listed: BTreeSet<_> =
            subs.iter().map(|sub| sub.subscription_id).collect();
        for id in self.subscription_ids() {
            if !listed.contains(&id) {
                self.remove(id);
            }
        }
        for sub in subs {
            self.upsert(sub);
        }
    }

    pub fn apply(&self, event: SubscriptionEvent) {
        match event.change {
            SubscriptionChange::Upsert(sub) => self.upsert(sub),
            SubscriptionChange::Delete(id) => {
                self.remove(id);
            }
        }
    }
}

// # Synchronizing with the store
impl Registry {
    /// Lists all subscriptions and marks the registry ready.
    ///
    /// Returns the revision to continue watching from.
    pub async fn load(
        &self, source: &dyn SubscriptionSource
    ) -> EdResult<u64> {
        let list = source.list().await?;
        let count = list.subscriptions.len();
        self.replace_all(list.subscriptions);
        self.ready.send_replace(true);
        info!(
            "Loaded {count} subscriptions at revision {}", list.revision
        );
        Ok(list.revision)
    }

    /// Waits until the first listing has completed.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Follows changes in the store until cancelled.
    pub async fn run_watch(
        self: Arc<Self>,
        source: Arc<dyn SubscriptionSource>,
        mut revision: u64,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        info!("Subscription watch started at revision {revision}");
        loop {
            let res = tokio::select! {
                _ = cancel.cancelled() => break,
                res = source.watch(revision) => res,
            };
            let pause = match res {
                Ok(events) if events.is_empty() => true,
                Ok(events) => {
                    for event in events {
                        revision = revision.max(event.revision);
                        self.apply(event);
                    }
                    false
                }
                Err(SourceError::CursorExpired) => {
                    warn!(
                        "Subscription revision {revision} expired, \
                         listing again"
                    );
                    match self.load(source.as_ref()).await {
                        Ok(rev) => {
                            revision = rev;
                            false
                        }
                        Err(e) => {
                            warn!("Cannot list subscriptions: {e}");
                            true
                        }
                    }
                }
                Err(e) => {
                    warn!("Cannot watch subscriptions: {e}");
                    true
                }
            };
            if pause {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => { }
                }
            }
        }
        info!("Subscription watch stopped");
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::source::MemorySubscriptionStore;
    use crate::test;

    fn sub(id: SubscriptionId, form: &str) -> Subscription {
        test::subscription(id, "http://localhost/cb", form)
    }

    #[test]
    fn update_applies_key_difference() {
        let registry = Registry::new();
        registry.upsert(sub(1, "hostcreate,hostdelete"));
        registry.upsert(sub(2, "hostcreate"));
        assert_eq!(registry.find_subscribers("hostcreate"), vec![1, 2]);
        assert_eq!(registry.find_subscribers("hostdelete"), vec![1]);

        registry.upsert(sub(1, "hostdelete"));
        assert_eq!(registry.find_subscribers("hostcreate"), vec![2]);
        assert_eq!(registry.find_subscribers("hostdelete"), vec![1]);

        registry.remove(2);
        assert!(!registry.is_subscribed("hostcreate"));
        assert!(registry.find_subscription(2).is_none());
        assert_eq!(registry.subscription_ids(), vec![1]);
    }

    #[test]
    fn replace_all_drops_missing() {
        let registry = Registry::new();
        registry.upsert(sub(1, "hostcreate"));
        registry.upsert(sub(2, "biz create"));
        registry.replace_all(vec![sub(2, "bizcreate"), sub(3, "setdelete")]);
        assert_eq!(registry.subscription_ids(), vec![2, 3]);
        assert!(!registry.is_subscribed("hostcreate"));
        assert_eq!(registry.find_subscribers("bizcreate"), vec![2]);
    }

    #[test]
    fn wanted_fields_union() {
        let registry = Registry::new();
        let mut a = sub(1, "hostcreate");
        a.fields = vec!["bk_host_id".into()];
        let mut b = sub(2, "hostcreate");
        b.fields = vec!["bk_host_innerip".into()];
        registry.upsert(a);
        registry.upsert(b);

        let fields = registry.wanted_fields("hostcreate").unwrap();
        assert_eq!(fields.len(), 2);

        registry.upsert(sub(3, "hostcreate"));
        assert!(registry.wanted_fields("hostcreate").is_none());
    }

    #[tokio::test]
    async fn load_and_watch() {
        let store = Arc::new(MemorySubscriptionStore::new());
        store.upsert(sub(1, "hostcreate")).unwrap();

        let registry = Arc::new(Registry::new());
        assert!(!registry.is_ready());
        let revision = registry.load(store.as_ref()).await.unwrap();
        registry.wait_ready().await;
        assert_eq!(registry.find_subscribers("hostcreate"), vec![1]);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(registry.clone().run_watch(
            store.clone(), revision, Duration::from_millis(10), cancel.clone()
        ));

        store.upsert(sub(1, "hostdelete")).unwrap();
        store.upsert(sub(2, "hostcreate")).unwrap();
        test::wait_for(|| registry.find_subscribers("hostcreate") == vec![2])
            .await;
        assert_eq!(registry.find_subscribers("hostdelete"), vec![1]);

        store.delete(1).unwrap();
        test::wait_for(|| registry.len() == 1).await;

        cancel.cancel();
        task.await.unwrap();
    }
}

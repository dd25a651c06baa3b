//! Wiring up and running the distribution pipeline.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{Cursor, ResourceKind, Subscription, SubscriptionId};
use crate::commons::error::Error;
use crate::commons::metrics::{Metric, Target};
use crate::commons::storage::KeyValueStore;
use crate::commons::EdResult;
use crate::config::{Config, LeaderElection};
use crate::constants::{EVENTD_SERVER_APP, EVENTD_VERSION};

use super::consumer::{ChangeConsumer, Translators};
use super::dispatch::Dispatcher;
use super::housekeeper::Housekeeper;
use super::ingest::EventIngestor;
use super::keys::Keys;
use super::leader::{AlwaysLeader, LeaderGate, LeaseLeader};
use super::pusher::PusherPool;
use super::registry::Registry;
use super::source::{
    Change, ChangeSource, MemoryChangeLog, MemorySubscriptionStore,
    SubscriptionSource,
};
use super::stats::{write_delivery_stats, CallbackStats, DeliveryStats};
use super::PipelineContext;


//------------ EventServer ---------------------------------------------------

/// The event distribution server.
///
/// Owns the pipeline context, the collaborators and all running pipeline
/// tasks.
pub struct EventServer {
    ctx: PipelineContext,

    changes: Arc<dyn ChangeSource>,
    subscriptions: Arc<dyn SubscriptionSource>,

    /// The in-process collaborators, if the server runs on them. Only
    /// these can be written to through the admin operations.
    change_log: Option<Arc<MemoryChangeLog>>,
    subscription_store: Option<Arc<MemorySubscriptionStore>>,

    pool: Arc<PusherPool>,

    /// The subscription revision the registry was loaded at.
    revision: u64,

    started: i64,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventServer {
    /// Builds a standalone server with empty in-process collaborators.
    ///
    /// The subscriptions from the config are registered right away.
    pub async fn build(config: Arc<Config>) -> EdResult<Self> {
        let subscriptions = MemorySubscriptionStore::with_subscriptions(
            config.subscriptions.iter().cloned()
        )?;
        Self::build_standalone(
            config,
            Arc::new(MemoryChangeLog::new()),
            Arc::new(subscriptions),
        ).await
    }

    /// Builds a server on the given in-process collaborators.
    ///
    /// Changes and subscriptions can then be fed through the admin
    /// operations.
    pub async fn build_standalone(
        config: Arc<Config>,
        change_log: Arc<MemoryChangeLog>,
        subscription_store: Arc<MemorySubscriptionStore>,
    ) -> EdResult<Self> {
        let mut server = Self::build_with(
            config, change_log.clone(), subscription_store.clone()
        ).await?;
        server.change_log = Some(change_log);
        server.subscription_store = Some(subscription_store);
        Ok(server)
    }

    /// Builds a server on top of the given collaborators.
    ///
    /// The registry is loaded before this returns. Failing to list the
    /// subscriptions is fatal.
    pub async fn build_with(
        config: Arc<Config>,
        changes: Arc<dyn ChangeSource>,
        subscriptions: Arc<dyn SubscriptionSource>,
    ) -> EdResult<Self> {
        info!("Starting {EVENTD_SERVER_APP} v{EVENTD_VERSION}");
        info!("{EVENTD_SERVER_APP} uses storage: {}", config.storage_uri);

        let store = KeyValueStore::create(&config.storage_uri).await?;

        let registry = Arc::new(Registry::new());
        let revision = registry.load(subscriptions.as_ref()).await?;

        let leader: Arc<dyn LeaderGate> = match config.leader_election {
            LeaderElection::Always => Arc::new(AlwaysLeader),
            LeaderElection::Lease => {
                let key = Keys::new(config.key_prefix.clone()).leader();
                let leader = LeaseLeader::new(
                    store.clone(), key, config.leader_lease()
                );
                info!("Competing for leadership as {}", leader.owner());
                Arc::new(leader)
            }
        };

        let ctx = PipelineContext::new(config, store, registry, leader);
        let pool = Arc::new(PusherPool::new(ctx.clone())?);

        Ok(EventServer {
            ctx,
            changes,
            subscriptions,
            change_log: None,
            subscription_store: None,
            pool,
            revision,
            started: Utc::now().timestamp(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawns all pipeline tasks.
    ///
    /// Consumers of a leading replica resume their cursors before anything
    /// is spawned, so changes recorded from here on are not missed.
    pub async fn start(&self) {
        let mut tasks = Vec::new();
        let config = self.ctx.config.clone();
        let ingestor = EventIngestor::new(self.ctx.clone());
        let translators = Translators::standard();
        let leading = self.ctx.leader.is_leader().await;

        for resource in &config.watch_resources {
            let Some(translator) = translators.get(*resource) else {
                warn!("No translator for resource {resource}, not watching");
                continue
            };
            let mut consumer = ChangeConsumer::new(
                *resource,
                translator,
                self.changes.clone(),
                ingestor.clone(),
                self.ctx.clone(),
            );
            if leading {
                if let Err(e) = consumer.resume().await {
                    warn!("Change consumer for {resource} cannot resume: {e}");
                }
            }
            tasks.push(tokio::spawn(consumer.run(self.cancel.clone())));
        }

        let dispatcher = Dispatcher::new(self.ctx.clone(), self.pool.clone());
        tasks.push(tokio::spawn(dispatcher.run(self.cancel.clone())));

        let housekeeper = Housekeeper::new(self.ctx.clone());
        tasks.push(tokio::spawn(housekeeper.run(self.cancel.clone())));

        tasks.push(tokio::spawn(
            self.pool.clone().run_reconcile(self.cancel.clone())
        ));

        tasks.push(tokio::spawn(self.ctx.registry.clone().run_watch(
            self.subscriptions.clone(),
            self.revision,
            config.watch_retry_interval(),
            self.cancel.clone(),
        )));

        info!(
            "Pipeline started with {} change consumers",
            config.watch_resources.len()
        );
        self.tasks.lock().expect("poisoned lock").extend(tasks);
    }

    /// Resolves once shutdown has been requested.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }

    /// Stops all tasks and waits for them.
    pub async fn shutdown(&self) {
        info!("Stopping pipeline");
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().expect("poisoned lock")
            .drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Pipeline task failed: {e}");
            }
        }
        self.pool.shutdown().await;
        self.ctx.leader.resign().await;
        info!("Pipeline stopped");
    }
}

// # Accessors
impl EventServer {
    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn registry(&self) -> &Registry {
        &self.ctx.registry
    }

    pub fn pool(&self) -> &PusherPool {
        &self.pool
    }

    pub fn stats(&self) -> &DeliveryStats {
        self.pool.stats()
    }

    pub fn change_log(&self) -> Option<&MemoryChangeLog> {
        self.change_log.as_deref()
    }

    pub fn subscription_store(&self) -> Option<&MemorySubscriptionStore> {
        self.subscription_store.as_deref()
    }

    fn writable_change_log(&self) -> EdResult<&MemoryChangeLog> {
        self.change_log().ok_or_else(|| {
            Error::ApiNotSupported("changes come from an external source")
        })
    }

    fn writable_subscriptions(&self) -> EdResult<&MemorySubscriptionStore> {
        self.subscription_store().ok_or_else(|| {
            Error::ApiNotSupported(
                "subscriptions are managed by an external store"
            )
        })
    }

    pub fn started(&self) -> i64 {
        self.started
    }
}

// # Admin operations
impl EventServer {
    /// Returns all subscriptions.
    ///
    /// Without an in-process store these are the ones the registry knows.
    pub fn list_subscriptions(&self) -> Vec<Subscription> {
        match self.subscription_store() {
            Some(store) => store.all(),
            None => self.ctx.registry.subscriptions().iter()
                .map(|sub| Subscription::clone(sub))
                .collect(),
        }
    }

    pub fn get_subscription(&self, id: SubscriptionId) -> Option<Subscription> {
        match self.subscription_store() {
            Some(store) => store.get(id),
            None => self.ctx.registry.find_subscription(id)
                .map(|sub| Subscription::clone(&sub)),
        }
    }

    /// Registers or replaces a subscription.
    ///
    /// The registry picks the change up through its watch.
    pub fn upsert_subscription(
        &self, sub: Subscription
    ) -> EdResult<Subscription> {
        let sub = self.writable_subscriptions()?.upsert(sub)?;
        info!(
            "Subscription {} ({}) registered for {}",
            sub.subscription_id, sub.subscription_name, sub.subscription_form
        );
        Ok(sub)
    }

    pub fn delete_subscription(
        &self, id: SubscriptionId
    ) -> EdResult<Subscription> {
        let sub = self.writable_subscriptions()?.delete(id)?;
        info!("Subscription {id} removed");
        Ok(sub)
    }

    pub async fn subscription_statistics(
        &self, id: SubscriptionId
    ) -> EdResult<CallbackStats> {
        if self.get_subscription(id).is_none() {
            return Err(Error::SubscriptionUnknown(id))
        }
        self.stats().get(id).await
    }

    /// Records changes of the named resource in the change log.
    pub fn append_changes(
        &self, resource: &str, changes: Vec<Change>
    ) -> EdResult<Vec<Cursor>> {
        let resource = ResourceKind::from_str(resource)?;
        let change_log = self.writable_change_log()?;
        Ok(
            changes.into_iter()
                .map(|change| change_log.append(resource, change))
                .collect()
        )
    }

    /// Renders all metrics in Prometheus format.
    pub async fn metrics(&self) -> EdResult<String> {
        let mut target = Target::default();

        target.single(
            Metric::gauge(
                "server_start", "Unix timestamp of the last server start"
            ),
            self.started,
        );
        target.single(
            Metric::gauge("leader", "whether this replica leads (1) or not"),
            u8::from(self.ctx.leader.is_leader().await),
        );
        target.single(
            Metric::gauge("subscriptions", "number of known subscriptions"),
            self.ctx.registry.len(),
        );
        target.single(
            Metric::gauge("pushers", "number of running pushers"),
            self.pool.len(),
        );

        let metric = Metric::gauge(
            "queue_length", "number of entries in the shared queues"
        );
        target.header(metric);
        for (name, key) in [
            ("main", self.ctx.keys.main_queue()),
            ("duplicate", self.ctx.keys.duplicate_queue()),
        ] {
            let len = self.ctx.store.llen(&key).await?;
            target.multi(metric).label("queue", name).value(len);
        }

        let ids = self.ctx.registry.subscription_ids();
        let metric = Metric::gauge(
            "subscriber_queue_length",
            "number of records waiting per subscription",
        );
        target.header(metric);
        let mut stats = HashMap::new();
        for id in ids {
            let len = self.ctx.store.llen(
                &self.ctx.keys.subscriber_queue(id)
            ).await?;
            target.multi(metric).label("subscription", id).value(len);
            stats.insert(id, self.stats().get(id).await?);
        }
        write_delivery_stats(&stats, &mut target);

        self.ctx.metrics.write(&mut target);
        Ok(target.into_string())
    }
}


//------------ Tests ---------------------------------------------------------

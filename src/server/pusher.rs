//! Delivering distribution records to subscribers.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::{DistributionRecord, SubscriptionId};
use crate::commons::httpclient::HttpClient;
use crate::commons::EdResult;

use super::stats::{DeliveryStats, Outcome, Stage};
use super::PipelineContext;


//------------ Pusher --------------------------------------------------------

/// The single consumer of one subscriber queue.
///
/// Records are handled strictly one after the other, in queue order. A
/// failed delivery is counted and the record dropped, there is no retry.
#[derive(Clone)]
pub struct Pusher {
    id: SubscriptionId,
    ctx: PipelineContext,
    client: HttpClient,
    stats: DeliveryStats,
}

impl Pusher {
    pub fn new(
        id: SubscriptionId,
        ctx: PipelineContext,
        client: HttpClient,
        stats: DeliveryStats,
    ) -> Self {
        Pusher { id, ctx, client, stats }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Pushes records while leading, until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!("Pusher for subscription {} started", self.id);
        let queue = self.ctx.keys.subscriber_queue(self.id);
        let pop_timeout = self.ctx.config.pop_timeout();
        let retry = self.ctx.config.watch_retry_interval();

        loop {
            if !self.ctx.wait_for_leadership(&cancel).await {
                break
            }
            let popped = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.ctx.store.brpop(&queue, pop_timeout) => res,
            };
            match popped {
                Ok(Some(json)) => {
                    if self.ctx.leader.is_leader().await {
                        self.push(&json).await;
                    }
                    else {
                        self.give_back(&queue, &json).await;
                    }
                }
                Ok(None) => { }
                Err(e) => {
                    error!(
                        "Cannot read queue of subscription {}: {e}", self.id
                    );
                    if !self.ctx.pause(retry, &cancel).await {
                        break
                    }
                }
            }
        }
        info!("Pusher for subscription {} stopped", self.id);
    }

    /// Returns a record popped after leadership was lost.
    ///
    /// It goes back to the consuming end of the queue, so the next leader
    /// delivers it before anything queued after it.
    async fn give_back(&self, queue: &str, json: &str) {
        match self.ctx.store.rpush(queue, json).await {
            Ok(_) => {
                debug!(
                    "Lost leadership, returned record to queue of \
                     subscription {}",
                    self.id
                );
            }
            Err(e) => {
                error!(
                    "Cannot return record to queue of subscription {}, \
                     it is lost: {e}",
                    self.id
                );
            }
        }
    }

    /// Delivers a single queued record.
    pub async fn push(&self, json: &str) -> Outcome {
        let started = Instant::now();
        let outcome = self.deliver(json).await;
        self.ctx.metrics.observe(Stage::Push, outcome, started.elapsed());
        outcome
    }

    async fn deliver(&self, json: &str) -> Outcome {
        let record = match DistributionRecord::from_json(json) {
            Ok(record) => record,
            Err(e) => {
                error!(
                    "Dropping malformed record for subscription {}: {e}",
                    self.id
                );
                return Outcome::Failure
            }
        };
        let key = record.event.key();
        let dist_id = record.distribution_id;

        if record.event.is_fused(
            Utc::now(), self.ctx.config.fused_event_expire()
        ) {
            warn!(
                "Distribution {dist_id} ({key}) for subscription {} is \
                 fused, dropping it",
                self.id
            );
            return Outcome::Fused
        }

        // Always use the latest registration.
        let Some(sub) = self.ctx.registry.find_subscription(self.id) else {
            warn!(
                "Subscription {} is gone, dropping distribution {dist_id}",
                self.id
            );
            return Outcome::Skipped
        };

        if let Err(e) = self.stats.incr_total(self.id).await {
            warn!("Cannot count callback for subscription {}: {e}", self.id);
        }

        let request_id = Uuid::new_v4().to_string();
        let body = record.callback_body(&request_id, &sub.owner_id);
        let timeout = sub.timeout(self.ctx.config.default_callback_timeout());

        let res = match self.client.post_json(
            &sub.callback_url, &body, timeout
        ).await {
            Ok(response) => sub.confirm(
                response.status.as_u16(), &response.body
            ).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match res {
            Ok(()) => {
                debug!(
                    "Delivered distribution {dist_id} ({key}) to \
                     subscription {}, request id {request_id}",
                    self.id
                );
                if let Err(e) = self.save_cursor(&record, &key).await {
                    warn!(
                        "Cannot save cursor of subscription {}: {e}", self.id
                    );
                }
                Outcome::Success
            }
            Err(msg) => {
                warn!(
                    "Callback of distribution {dist_id} ({key}) to \
                     subscription {} failed, request id {request_id}: {msg}",
                    self.id
                );
                if let Err(e) = self.stats.incr_failure(self.id).await {
                    warn!(
                        "Cannot count failure for subscription {}: {e}",
                        self.id
                    );
                }
                Outcome::Failure
            }
        }
    }

    async fn save_cursor(
        &self, record: &DistributionRecord, key: &str
    ) -> EdResult<()> {
        if record.event.cursor.is_empty() {
            return Ok(())
        }
        self.ctx.store.set(
            &self.ctx.keys.subscriber_cursor(key, self.id),
            &record.event.cursor,
            Some(self.ctx.config.subscriber_cursor_ttl()),
        ).await?;
        Ok(())
    }
}


//------------ PusherPool ----------------------------------------------------

struct PusherHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// The running pushers, one per subscriber.
///
/// Pushers are started on first need and stopped once their subscription
/// has disappeared from the registry.
pub struct PusherPool {
    ctx: PipelineContext,
    client: HttpClient,
    stats: DeliveryStats,
    pushers: Mutex<HashMap<SubscriptionId, PusherHandle>>,
    cancel: CancellationToken,
}

impl PusherPool {
    pub fn new(ctx: PipelineContext) -> EdResult<Self> {
        let client = HttpClient::new()?;
        let stats = DeliveryStats::new(ctx.store.clone(), ctx.keys.clone());
        Ok(PusherPool {
            ctx,
            client,
            stats,
            pushers: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    /// Returns a pusher for the subscription without starting it.
    pub fn pusher(&self, id: SubscriptionId) -> Pusher {
        Pusher::new(
            id, self.ctx.clone(), self.client.clone(), self.stats.clone()
        )
    }

    /// Makes sure a pusher is running for the subscription.
    ///
    /// Returns whether a new one had to be started.
    pub fn ensure(&self, id: SubscriptionId) -> bool {
        let mut pushers = self.pushers.lock().expect("poisoned lock");
        if let Some(handle) = pushers.get(&id) {
            if !handle.task.is_finished() {
                return false
            }
        }
        if self.cancel.is_cancelled() {
            return false
        }
        let cancel = self.cancel.child_token();
        let task = tokio::spawn(self.pusher(id).run(cancel.clone()));
        pushers.insert(id, PusherHandle { cancel, task });
        true
    }

    /// Stops the pusher of a subscription and waits for it to finish.
    pub async fn stop(&self, id: SubscriptionId) -> bool {
        let handle = self.pushers.lock().expect("poisoned lock").remove(&id);
        match handle {
            Some(handle) => {
                handle.cancel.cancel();
                if let Err(e) = handle.task.await {
                    error!("Pusher for subscription {id} failed: {e}");
                }
                true
            }
            None => false,
        }
    }

    pub fn ids(&self) -> Vec<SubscriptionId> {
        self.pushers.lock().expect("poisoned lock").keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.pushers.lock().expect("poisoned lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Brings the pushers in line with the registry.
    ///
    /// Every registered subscription gets a pusher, so queues left over
    /// from before a restart are drained. Pushers of subscriptions that
    /// are gone are stopped and, when leading, their queues removed.
    pub async fn reconcile(&self) -> Reconciled {
        let live: BTreeSet<_> =
            self.ctx.registry.subscription_ids().into_iter().collect();
        let mut res = Reconciled::default();

        for id in &live {
            if self.ensure(*id) {
                res.started.push(*id);
            }
        }

        res.stopped = self.remove_stale(&live).await;
        res
    }

    /// Stops the pushers of subscriptions missing from `live`.
    ///
    /// Returns the ids of the pushers stopped.
    async fn remove_stale(
        &self, live: &BTreeSet<SubscriptionId>
    ) -> Vec<SubscriptionId> {
        let stale: Vec<_> = self.ids().into_iter()
            .filter(|id| !live.contains(id))
            .collect();
        let leading = self.ctx.leader.is_leader().await;
        let mut stopped = Vec::new();
        for id in stale {
            // The subscription may have come back since the snapshot.
            if self.ctx.registry.find_subscription(id).is_some() {
                continue
            }
            self.stop(id).await;
            if leading {
                let queue = self.ctx.keys.subscriber_queue(id);
                if let Err(e) = self.ctx.store.del(&queue).await {
                    warn!("Cannot remove queue of subscription {id}: {e}");
                }
            }
            info!("Removed pusher of deleted subscription {id}");
            stopped.push(id);
        }
        stopped
    }

    /// Reconciles periodically until cancelled.
    pub async fn run_reconcile(self: Arc<Self>, cancel: CancellationToken) {
        let interval = self.ctx.config.reconcile_interval();
        loop {
            let res = self.reconcile().await;
            if !res.is_empty() {
                debug!(
                    "Pusher reconciliation started {:?}, stopped {:?}",
                    res.started, res.stopped
                );
            }
            if !self.ctx.pause(interval, &cancel).await {
                break
            }
        }
    }

    /// Stops all pushers.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.pushers.lock().expect("poisoned lock")
            .drain().collect();
        for (id, handle) in handles {
            if let Err(e) = handle.task.await {
                error!("Pusher for subscription {id} failed: {e}");
            }
        }
    }
}


//------------ Reconciled ----------------------------------------------------

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Reconciled {
    pub started: Vec<SubscriptionId>,
    pub stopped: Vec<SubscriptionId>,
}

impl Reconciled {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}


//------------ Tests ---------------------------------------------------------

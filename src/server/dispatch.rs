//! Fanning events out to subscriber queues.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{debug, error, info, trace, warn};
use tokio_util::sync::CancellationToken;

use crate::api::{DistributionRecord, Event, Subscription};
use crate::commons::EdResult;

use super::pusher::PusherPool;
use super::stats::{Outcome, Stage};
use super::PipelineContext;


//------------ Dispatcher ----------------------------------------------------

/// Drains the main queue into the subscriber queues.
///
/// Events are moved atomically from the main queue to the duplicate queue
/// before they are handled and only removed from there once every
/// subscriber queue has been written. An event popped by a process that
/// dies before finishing is thus moved back and handled again on the
/// next start.
pub struct Dispatcher {
    ctx: PipelineContext,
    pool: Arc<PusherPool>,
}

impl Dispatcher {
    pub fn new(ctx: PipelineContext, pool: Arc<PusherPool>) -> Self {
        Dispatcher { ctx, pool }
    }

    /// Moves unacknowledged events back to the main queue.
    ///
    /// They are placed at the consuming end in their original order, so
    /// they are handled before anything queued since. Returns the number
    /// of events recovered.
    pub async fn recover(&self) -> EdResult<usize> {
        let dup = self.ctx.keys.duplicate_queue();
        let main = self.ctx.keys.main_queue();
        let mut count = 0;
        while self.ctx.store.lpop_rpush(&dup, &main).await?.is_some() {
            count += 1;
        }
        if count > 0 {
            info!("Recovered {count} unacknowledged events");
        }
        Ok(count)
    }

    /// Waits for the next event and moves it to the duplicate queue.
    async fn pop(&self) -> EdResult<Option<String>> {
        self.ctx.store.brpoplpush(
            &self.ctx.keys.main_queue(),
            &self.ctx.keys.duplicate_queue(),
            self.ctx.config.pop_timeout(),
        ).await.map_err(Into::into)
    }

    /// Returns an event popped after leadership was lost.
    ///
    /// The event goes back to the consuming end of the main queue before
    /// it is taken off the duplicate queue, so it is never lost but may be
    /// seen twice.
    async fn give_back(&self, json: &str) -> EdResult<()> {
        self.ctx.store.rpush(&self.ctx.keys.main_queue(), json).await?;
        self.ctx.store.lrem(&self.ctx.keys.duplicate_queue(), json).await?;
        debug!("Lost leadership, returned event to the main queue");
        Ok(())
    }

    /// Handles a popped event and acknowledges it.
    async fn process(&self, json: &str) -> EdResult<Outcome> {
        let started = Instant::now();
        let outcome = self.dispatch(json).await;
        self.ctx.metrics.observe(Stage::Dispatch, outcome, started.elapsed());
        self.ctx.store.lrem(&self.ctx.keys.duplicate_queue(), json).await?;
        Ok(outcome)
    }

    /// Handles the next event, if one arrives in time.
    pub async fn dispatch_next(&self) -> EdResult<Option<Outcome>> {
        match self.pop().await? {
            Some(json) => self.process(&json).await.map(Some),
            None => Ok(None),
        }
    }

    async fn dispatch(&self, json: &str) -> Outcome {
        let event = match Event::from_json(json) {
            Ok(event) => event,
            Err(e) => {
                error!("Dropping malformed event from main queue: {e}");
                return Outcome::Failure
            }
        };

        if event.is_fused(Utc::now(), self.ctx.config.fused_event_expire()) {
            warn!(
                "Event {} ({}) from {} is fused, not distributing it",
                event.id, event.key(), event.action_time
            );
            return Outcome::Fused
        }

        let key = event.key();
        let subscribers = self.ctx.registry.find_subscribers(&key);
        if subscribers.is_empty() {
            trace!("No subscribers for event {} ({key})", event.id);
            return Outcome::Skipped
        }

        let mut outcome = Outcome::Success;
        for id in subscribers {
            let Some(sub) = self.ctx.registry.find_subscription(id) else {
                continue
            };
            match self.distribute(&event, &sub).await {
                Ok(dist_id) => {
                    debug!(
                        "Event {} ({key}) queued for subscription {id} \
                         as distribution {dist_id}",
                        event.id
                    );
                }
                Err(e) => {
                    // Delivery of this event to this subscriber is lost.
                    error!(
                        "Cannot queue event {} ({key}) for subscription \
                         {id}: {e}",
                        event.id
                    );
                    outcome = Outcome::Failure;
                }
            }
        }
        outcome
    }

    /// Queues the event for one subscriber, returns the distribution id.
    async fn distribute(
        &self, event: &Event, sub: &Subscription
    ) -> EdResult<i64> {
        let id = sub.subscription_id;
        self.pool.ensure(id);

        let dist_id = self.ctx.store.incr(
            &self.ctx.keys.distribution_id(id)
        ).await?;
        let record = DistributionRecord::new(
            event.project(&sub.field_set()), dist_id, id
        );
        self.ctx.store.lpush(
            &self.ctx.keys.subscriber_queue(id), &record.to_json()?
        ).await?;
        Ok(dist_id)
    }

    /// Dispatches events while leading, until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!("Dispatcher started");
        let check_interval = self.ctx.config.leader_check_interval();
        let retry = self.ctx.config.watch_retry_interval();
        let mut recovered = false;

        loop {
            if cancel.is_cancelled() {
                break
            }
            if !self.ctx.leader.is_leader().await {
                recovered = false;
                if !self.ctx.pause(check_interval, &cancel).await {
                    break
                }
                continue
            }
            if !recovered {
                match self.recover().await {
                    Ok(_) => recovered = true,
                    Err(e) => {
                        error!("Cannot recover unacknowledged events: {e}");
                        if !self.ctx.pause(retry, &cancel).await {
                            break
                        }
                        continue
                    }
                }
            }

            // Only the wait may be interrupted. Once popped, an event is
            // handled completely.
            let popped = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.pop() => res,
            };
            let res = match popped {
                Ok(Some(json)) => {
                    if self.ctx.leader.is_leader().await {
                        self.process(&json).await.map(|_| ())
                    }
                    else {
                        recovered = false;
                        self.give_back(&json).await
                    }
                }
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = res {
                error!("Dispatcher failed: {e}");
                if !self.ctx.pause(retry, &cancel).await {
                    break
                }
            }
        }
        info!("Dispatcher stopped");
    }
}


//------------ Tests ---------------------------------------------------------

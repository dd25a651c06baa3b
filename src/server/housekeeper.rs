//! Keeping the queues bounded.

use std::time::Instant;

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::commons::EdResult;
use crate::config::QueueThresholds;

use super::stats::{Outcome, Stage};
use super::PipelineContext;


//------------ CleanAction ---------------------------------------------------

/// What happened to a queue during a cleaning pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CleanAction {
    None,

    /// The given number of oldest entries was dropped.
    Trimmed(usize),

    /// The queue held the given number of entries and was removed.
    Cleared(usize),
}

impl CleanAction {
    /// Decides what to do with a queue of the given length.
    pub fn decide(len: usize, thresholds: QueueThresholds) -> Self {
        if len > thresholds.delete {
            CleanAction::Cleared(len)
        }
        else if len > thresholds.trim {
            CleanAction::Trimmed(thresholds.clean_unit.min(len))
        }
        else {
            CleanAction::None
        }
    }
}


//------------ Housekeeper ---------------------------------------------------

/// Periodically trims the main queue and all subscriber queues.
///
/// New entries are pushed at the head and consumed from the tail, so
/// trimming drops from the tail. This loses the oldest undelivered
/// entries, which is accepted in exchange for bounded memory use.
pub struct Housekeeper {
    ctx: PipelineContext,
}

impl Housekeeper {
    pub fn new(ctx: PipelineContext) -> Self {
        Housekeeper { ctx }
    }

    pub async fn clean_queue(&self, key: &str) -> EdResult<CleanAction> {
        let len = self.ctx.store.llen(key).await?;
        let action = CleanAction::decide(len, self.ctx.config.thresholds());
        match action {
            CleanAction::None => { }
            CleanAction::Trimmed(dropped) => {
                let keep = len - dropped;
                if keep == 0 {
                    self.ctx.store.del(key).await?;
                }
                else {
                    self.ctx.store.ltrim(key, 0, keep as isize - 1).await?;
                }
                warn!(
                    "Queue {key} held {len} entries, dropped the oldest \
                     {dropped}"
                );
            }
            CleanAction::Cleared(_) => {
                self.ctx.store.del(key).await?;
                warn!("Queue {key} held {len} entries, removed it");
            }
        }
        Ok(action)
    }

    /// Cleans the main queue and the queue of every known subscriber.
    ///
    /// A failure on one queue does not stop the others. Returns the number
    /// of queues that were changed.
    pub async fn clean_once(&self) -> usize {
        let mut queues = vec![self.ctx.keys.main_queue()];
        queues.extend(
            self.ctx.registry.subscription_ids().into_iter()
                .map(|id| self.ctx.keys.subscriber_queue(id))
        );

        let mut changed = 0;
        for queue in queues {
            let started = Instant::now();
            let outcome = match self.clean_queue(&queue).await {
                Ok(CleanAction::None) => Outcome::Skipped,
                Ok(_) => {
                    changed += 1;
                    Outcome::Success
                }
                Err(e) => {
                    error!("Cannot clean queue {queue}: {e}");
                    Outcome::Failure
                }
            };
            self.ctx.metrics.observe(Stage::Clean, outcome, started.elapsed());
        }
        changed
    }

    /// Cleans periodically while leading, until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!("Queue housekeeper started");
        let interval = self.ctx.config.clean_interval();
        while self.ctx.pause(interval, &cancel).await {
            if !self.ctx.leader.is_leader().await {
                continue
            }
            let changed = self.clean_once().await;
            if changed > 0 {
                debug!("Housekeeping changed {changed} queues");
            }
        }
        info!("Queue housekeeper stopped");
    }
}


//------------ Tests ---------------------------------------------------------

//! Handing events to the main queue.

use std::time::Instant;

use log::trace;

use crate::api::Event;
use crate::commons::EdResult;

use super::stats::{Outcome, Stage};
use super::PipelineContext;


//------------ EventIngestor -------------------------------------------------

/// Writes translated events to the durable main queue.
///
/// There is no deduplication here. Every event gets a fresh id from the
/// event id counter, which is for diagnostics only and plays no part in
/// ordering.
#[derive(Clone)]
pub struct EventIngestor {
    ctx: PipelineContext,
}

impl EventIngestor {
    pub fn new(ctx: PipelineContext) -> Self {
        EventIngestor { ctx }
    }

    /// Assigns the event id and queues the event.
    ///
    /// Returns the id assigned.
    pub async fn enqueue(&self, mut event: Event) -> EdResult<i64> {
        let started = Instant::now();
        let res = self.push(&mut event).await;
        let outcome = if res.is_ok() { Outcome::Success } else { Outcome::Failure };
        self.ctx.metrics.observe(Stage::Ingest, outcome, started.elapsed());
        res
    }

    async fn push(&self, event: &mut Event) -> EdResult<i64> {
        event.id = self.ctx.store.incr(&self.ctx.keys.event_id()).await?;
        let json = event.to_json()?;
        let len = self.ctx.store.lpush(&self.ctx.keys.main_queue(), &json).await?;
        trace!(
            "Queued event {} ({}), main queue length {len}",
            event.id, event.key()
        );
        Ok(event.id)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test;

    #[tokio::test]
    async fn enqueue_assigns_ids_in_order() {
        let ctx = test::pipeline_context().await;
        let ingestor = EventIngestor::new(ctx.clone());

        let first = ingestor.enqueue(test::host_event("hostcreate")).await.unwrap();
        let second = ingestor.enqueue(test::host_event("hostdelete")).await.unwrap();
        assert_eq!((first, second), (1, 2));

        let main = ctx.keys.main_queue();
        assert_eq!(ctx.store.llen(&main).await.unwrap(), 2);

        // the oldest event is popped first
        let json = ctx.store.brpop(&main, Duration::from_millis(10))
            .await.unwrap().unwrap();
        let event = Event::from_json(&json).unwrap();
        assert_eq!(event.id, 1);
        assert_eq!(event.key(), "hostcreate");
    }
}

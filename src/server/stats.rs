//! Delivery statistics and pipeline metrics.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::SubscriptionId;
use crate::commons::metrics::{Metric, Target};
use crate::commons::storage::KeyValueStore;
use crate::commons::EdResult;
use crate::constants::{STATS_FIELD_FAILURE, STATS_FIELD_TOTAL};

use super::keys::Keys;


//------------ CallbackStats -------------------------------------------------

/// The delivery counters of one subscription.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CallbackStats {
    pub total: i64,
    pub failure: i64,
}


//------------ DeliveryStats -------------------------------------------------

/// Access to the per subscription counters in the key-value store.
#[derive(Clone, Debug)]
pub struct DeliveryStats {
    store: KeyValueStore,
    keys: Keys,
}

impl DeliveryStats {
    pub fn new(store: KeyValueStore, keys: Keys) -> Self {
        DeliveryStats { store, keys }
    }

    pub async fn incr_total(&self, id: SubscriptionId) -> EdResult<i64> {
        self.store.hincr(
            &self.keys.subscriber_stats(id), STATS_FIELD_TOTAL, 1
        ).await.map_err(Into::into)
    }

    pub async fn incr_failure(&self, id: SubscriptionId) -> EdResult<i64> {
        self.store.hincr(
            &self.keys.subscriber_stats(id), STATS_FIELD_FAILURE, 1
        ).await.map_err(Into::into)
    }

    pub async fn get(&self, id: SubscriptionId) -> EdResult<CallbackStats> {
        let fields = self.store.hgetall(
            &self.keys.subscriber_stats(id)
        ).await?;
        Ok(CallbackStats {
            total: fields.get(STATS_FIELD_TOTAL).copied().unwrap_or(0),
            failure: fields.get(STATS_FIELD_FAILURE).copied().unwrap_or(0),
        })
    }

    /// Clears the counters. Used by external reset tooling only.
    pub async fn reset(&self, id: SubscriptionId) -> EdResult<()> {
        self.store.del(&self.keys.subscriber_stats(id)).await?;
        Ok(())
    }
}


//------------ Stage ---------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    Consume,
    Ingest,
    Dispatch,
    Push,
    Clean,
}

impl Stage {
    const ALL: [Stage; 5] = [
        Stage::Consume, Stage::Ingest, Stage::Dispatch, Stage::Push,
        Stage::Clean,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Stage::Consume => "consume",
            Stage::Ingest => "ingest",
            Stage::Dispatch => "dispatch",
            Stage::Push => "push",
            Stage::Clean => "clean",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


//------------ Outcome -------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The item was handled.
    Success,

    /// Handling the item failed, it is dropped.
    Failure,

    /// The item was not of interest.
    Skipped,

    /// The item was too old and discarded.
    Fused,
}

impl Outcome {
    const ALL: [Outcome; 4] = [
        Outcome::Success, Outcome::Failure, Outcome::Skipped, Outcome::Fused,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Skipped => "skipped",
            Outcome::Fused => "fused",
        }
    }
}


//------------ PipelineMetrics -----------------------------------------------

const STAGES: usize = Stage::ALL.len();
const OUTCOMES: usize = Outcome::ALL.len();

/// Upper bounds of the duration histogram buckets in microseconds.
const DURATION_BUCKETS_US: [u64; 9] = [
    1_000, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000, 5_000_000,
    10_000_000,
];
const BUCKETS: usize = DURATION_BUCKETS_US.len();

/// In-process counters of everything passing through the pipeline.
///
/// Processing times are kept as a histogram per stage. Buckets hold the
/// number of observations falling into them only, they are made
/// cumulative when written.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    counts: [[AtomicU64; OUTCOMES]; STAGES],
    buckets: [[AtomicU64; BUCKETS]; STAGES],
    observed: [AtomicU64; STAGES],
    durations_us: [AtomicU64; STAGES],
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, stage: Stage, outcome: Outcome) {
        self.counts[stage as usize][outcome as usize]
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe(&self, stage: Stage, outcome: Outcome, took: Duration) {
        self.count(stage, outcome);
        let us = u64::try_from(took.as_micros()).unwrap_or(u64::MAX);
        let stage = stage as usize;
        if let Some(bucket) = DURATION_BUCKETS_US.iter().position(|b| us <= *b) {
            self.buckets[stage][bucket].fetch_add(1, Ordering::Relaxed);
        }
        self.observed[stage].fetch_add(1, Ordering::Relaxed);
        self.durations_us[stage].fetch_add(us, Ordering::Relaxed);
    }

    pub fn get(&self, stage: Stage, outcome: Outcome) -> u64 {
        self.counts[stage as usize][outcome as usize].load(Ordering::Relaxed)
    }

    /// Writes all counters in Prometheus format.
    pub fn write(&self, target: &mut Target) {
        let metric = Metric::counter(
            "pipeline_items_total",
            "number of items processed per pipeline stage and outcome",
        );
        target.header(metric);
        for stage in Stage::ALL {
            for outcome in Outcome::ALL {
                target.multi(metric)
                    .label("stage", stage)
                    .label("outcome", outcome.as_str())
                    .value(self.get(stage, outcome));
            }
        }

        let metric = Metric::histogram(
            "pipeline_duration_seconds",
            "processing time per pipeline stage",
        );
        target.header(metric);
        for stage in Stage::ALL {
            let idx = stage as usize;
            let mut cumulative = 0;
            for (bucket, bound) in DURATION_BUCKETS_US.iter().enumerate() {
                cumulative += self.buckets[idx][bucket].load(Ordering::Relaxed);
                target.series(metric, "_bucket")
                    .label("stage", stage)
                    .label("le", *bound as f64 / 1_000_000.0)
                    .value(cumulative);
            }
            let count = self.observed[idx].load(Ordering::Relaxed);
            target.series(metric, "_bucket")
                .label("stage", stage)
                .label("le", "+Inf")
                .value(count);
            let us = self.durations_us[idx].load(Ordering::Relaxed);
            target.series(metric, "_sum")
                .label("stage", stage)
                .value(format!("{:.6}", us as f64 / 1_000_000.0));
            target.series(metric, "_count")
                .label("stage", stage)
                .value(count);
        }
    }
}

/// Writes the delivery statistics of the given subscriptions.
pub fn write_delivery_stats(
    stats: &HashMap<SubscriptionId, CallbackStats>,
    target: &mut Target,
) {
    let mut ids: Vec<_> = stats.keys().copied().collect();
    ids.sort_unstable();

    let metric = Metric::counter(
        "callback_total", "number of callbacks sent per subscription",
    );
    target.header(metric);
    for id in &ids {
        target.multi(metric)
            .label("subscription", id)
            .value(stats[id].total);
    }

    let metric = Metric::counter(
        "callback_failure_total",
        "number of callbacks not confirmed per subscription",
    );
    target.header(metric);
    for id in &ids {
        target.multi(metric)
            .label("subscription", id)
            .value(stats[id].failure);
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[tokio::test]
    async fn delivery_counters() {
        let store = KeyValueStore::create(&test::mem_storage()).await.unwrap();
        let stats = DeliveryStats::new(store, Keys::default());

        assert_eq!(stats.get(1).await.unwrap(), CallbackStats::default());
        stats.incr_total(1).await.unwrap();
        stats.incr_total(1).await.unwrap();
        stats.incr_failure(1).await.unwrap();
        assert_eq!(
            stats.get(1).await.unwrap(),
            CallbackStats { total: 2, failure: 1 }
        );

        stats.reset(1).await.unwrap();
        assert_eq!(stats.get(1).await.unwrap(), CallbackStats::default());
    }

    #[test]
    fn pipeline_metrics_output() {
        let metrics = PipelineMetrics::new();
        metrics.count(Stage::Dispatch, Outcome::Fused);
        metrics.observe(
            Stage::Push, Outcome::Success, Duration::from_millis(1500)
        );

        let mut target = Target::default();
        metrics.write(&mut target);
        let out = target.as_str();
        assert!(out.contains(
            "eventd_pipeline_items_total{stage=\"dispatch\", \
             outcome=\"fused\"} 1"
        ));
        assert!(out.contains(
            "# TYPE eventd_pipeline_duration_seconds histogram"
        ));
        for (le, count) in [("1", 0), ("5", 1), ("10", 1), ("+Inf", 1)] {
            assert!(out.contains(&format!(
                "eventd_pipeline_duration_seconds_bucket{{stage=\"push\", \
                 le=\"{le}\"}} {count}"
            )));
        }
        assert!(out.contains(
            "eventd_pipeline_duration_seconds_sum{stage=\"push\"} 1.500000"
        ));
        assert!(out.contains(
            "eventd_pipeline_duration_seconds_count{stage=\"push\"} 1"
        ));
        assert!(out.contains(
            "eventd_pipeline_duration_seconds_count{stage=\"dispatch\"} 0"
        ));
    }
}

//! The event distribution pipeline.
//!
//! Changes flow from the [`consumer`]s through the [`ingest`]or onto the
//! main queue, are fanned out per subscriber by the [`dispatch`]er and
//! finally delivered by one [`pusher`] per subscriber. The
//! [`housekeeper`] keeps the queues bounded. All of this is wired up by
//! the [`manager`].

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::commons::storage::KeyValueStore;
use crate::config::Config;

use self::keys::Keys;
use self::leader::LeaderGate;
use self::registry::Registry;
use self::stats::PipelineMetrics;

pub mod consumer;
pub mod dispatch;
pub mod housekeeper;
pub mod ingest;
pub mod keys;
pub mod leader;
pub mod manager;
pub mod pusher;
pub mod registry;
pub mod source;
pub mod stats;


//------------ PipelineContext -----------------------------------------------

/// The handles shared by all pipeline components.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<Config>,
    pub store: KeyValueStore,
    pub keys: Keys,
    pub registry: Arc<Registry>,
    pub leader: Arc<dyn LeaderGate>,
    pub metrics: Arc<PipelineMetrics>,
}

impl PipelineContext {
    pub fn new(
        config: Arc<Config>,
        store: KeyValueStore,
        registry: Arc<Registry>,
        leader: Arc<dyn LeaderGate>,
    ) -> Self {
        PipelineContext {
            keys: Keys::new(config.key_prefix.clone()),
            config,
            store,
            registry,
            leader,
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    /// Sleeps for the given time.
    ///
    /// Returns `false` if cancelled in the meantime.
    pub async fn pause(
        &self, duration: Duration, cancel: &CancellationToken
    ) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Waits until this replica leads.
    ///
    /// Returns `false` if cancelled first.
    pub async fn wait_for_leadership(
        &self, cancel: &CancellationToken
    ) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false
            }
            if self.leader.is_leader().await {
                return true
            }
            if !self.pause(self.config.leader_check_interval(), cancel).await {
                return false
            }
        }
    }
}

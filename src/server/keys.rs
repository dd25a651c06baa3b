//! Names of the keys used in the key-value store.

use crate::api::{ResourceKind, SubscriptionId};
use crate::constants::*;


//------------ Keys ----------------------------------------------------------

/// Builds the full, prefixed key names.
#[derive(Clone, Debug)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Keys { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn main_queue(&self) -> String {
        format!("{}{}", self.prefix, MAIN_QUEUE)
    }

    pub fn duplicate_queue(&self) -> String {
        format!("{}{}", self.prefix, DUPLICATE_QUEUE)
    }

    pub fn event_id(&self) -> String {
        format!("{}{}", self.prefix, EVENT_ID_COUNTER)
    }

    pub fn leader(&self) -> String {
        format!("{}{}", self.prefix, LEADER_LEASE)
    }

    pub fn subscriber_queue(&self, id: SubscriptionId) -> String {
        format!("{}{}{}", self.prefix, SUBSCRIBER_QUEUE, id)
    }

    pub fn subscriber_stats(&self, id: SubscriptionId) -> String {
        format!("{}{}{}", self.prefix, SUBSCRIBER_STATS, id)
    }

    pub fn distribution_id(&self, id: SubscriptionId) -> String {
        format!("{}{}{}", self.prefix, DISTRIBUTION_ID_COUNTER, id)
    }

    /// The resume cursor of a subscriber for one event key.
    pub fn subscriber_cursor(
        &self, event_key: &str, id: SubscriptionId
    ) -> String {
        format!("{}{}{}:{}", self.prefix, SUBSCRIBER_CURSOR, event_key, id)
    }

    pub fn resource_cursor(&self, resource: ResourceKind) -> String {
        format!("{}{}{}", self.prefix, RESOURCE_CURSOR, resource)
    }
}

impl Default for Keys {
    fn default() -> Self {
        Keys::new(DEFAULT_KEY_PREFIX)
    }
}


//------------ Tests ---------------------------------------------------------

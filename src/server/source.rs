//! The collaborators feeding the pipeline.
//!
//! The pipeline reads changes from a [`ChangeSource`] and learns about
//! subscribers from a [`SubscriptionSource`]. Both are traits so that the
//! document database and the subscription store can be plugged in. The
//! in-process implementations in this module back the standalone daemon
//! and the tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::{Cursor, ResourceKind, Subscription, SubscriptionId};
use crate::commons::error::Error;
use crate::commons::EdResult;

/// Number of subscription changes kept for watchers.
const SUBSCRIPTION_HISTORY: usize = 1024;


//------------ Operation -----------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}


//------------ Change --------------------------------------------------------

/// A mutation of a single document as reported by the change source.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Change {
    pub operation: Operation,

    /// The document after the change, null for deletes.
    #[serde(default)]
    pub document: Value,

    /// The document before the change, if the source supplies it.
    #[serde(default)]
    pub pre_image: Value,

    #[serde(default)]
    pub updated_fields: Vec<String>,

    #[serde(default)]
    pub deleted_fields: Vec<String>,
}

impl Change {
    pub fn insert(document: Value) -> Self {
        Change {
            operation: Operation::Insert,
            document,
            pre_image: Value::Null,
            updated_fields: vec![],
            deleted_fields: vec![],
        }
    }

    pub fn update(
        document: Value, pre_image: Value, updated_fields: Vec<String>
    ) -> Self {
        Change {
            operation: Operation::Update,
            document,
            pre_image,
            updated_fields,
            deleted_fields: vec![],
        }
    }

    pub fn delete(pre_image: Value) -> Self {
        Change {
            operation: Operation::Delete,
            document: Value::Null,
            pre_image,
            updated_fields: vec![],
            deleted_fields: vec![],
        }
    }
}


//------------ ChangeRecord --------------------------------------------------

/// A change together with its position in the stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChangeRecord {
    pub cursor: Cursor,

    /// When the change was committed.
    pub time: DateTime<Utc>,

    pub change: Change,
}


//------------ ChangeBatch ---------------------------------------------------

#[derive(Clone, Debug)]
pub struct ChangeBatch {
    pub records: Vec<ChangeRecord>,

    /// Where to continue reading.
    pub next: Cursor,
}


//------------ ChangeSource --------------------------------------------------

/// An ordered, resumable stream of changes per resource kind.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Returns up to `limit` records following `after`.
    ///
    /// Without a cursor reading starts at the oldest record still retained.
    /// Returns [`SourceError::NoNewData`] if nothing follows the cursor.
    async fn list(
        &self,
        resource: ResourceKind,
        after: Option<&Cursor>,
        limit: usize,
    ) -> Result<ChangeBatch, SourceError>;

    /// Returns the cursor of the newest record, i.e., "now".
    async fn latest(
        &self, resource: ResourceKind
    ) -> Result<Option<Cursor>, SourceError>;
}


//------------ MemoryChangeLog -----------------------------------------------

/// An in-process change source.
///
/// Changes are appended by the daemon's admin API or by tests. If a
/// retention limit is set, the oldest records are dropped and cursors
/// pointing before them expire.
#[derive(Debug, Default)]
pub struct MemoryChangeLog {
    logs: Mutex<HashMap<ResourceKind, ResourceLog>>,
    retention: Option<usize>,
}

#[derive(Debug, Default)]
struct ResourceLog {
    records: VecDeque<ChangeRecord>,
    last: Option<Cursor>,
    dropped: Option<Cursor>,
}

impl MemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        MemoryChangeLog {
            logs: Mutex::new(HashMap::new()),
            retention: Some(retention.max(1)),
        }
    }

    /// Appends a change committed now.
    pub fn append(&self, resource: ResourceKind, change: Change) -> Cursor {
        self.append_at(resource, Utc::now(), change)
    }

    /// Appends a change committed at the given time.
    ///
    /// Cursors never go backwards, a change with an earlier time than its
    /// predecessor is positioned right after it.
    pub fn append_at(
        &self,
        resource: ResourceKind,
        time: DateTime<Utc>,
        change: Change,
    ) -> Cursor {
        let mut logs = self.logs.lock().expect("poisoned lock");
        let log = logs.entry(resource).or_default();

        let secs = time.timestamp();
        let cursor = match &log.last {
            Some(last) if last.cluster_time() >= secs => Cursor::new(
                resource, last.cluster_time(), last.index() + 1
            ),
            _ => Cursor::new(resource, secs, 0),
        };

        log.records.push_back(ChangeRecord {
            cursor: cursor.clone(),
            time,
            change,
        });
        log.last = Some(cursor.clone());

        if let Some(retention) = self.retention {
            while log.records.len() > retention {
                if let Some(dropped) = log.records.pop_front() {
                    log.dropped = Some(dropped.cursor);
                }
            }
        }
        cursor
    }

    pub fn len(&self, resource: ResourceKind) -> usize {
        self.logs.lock().expect("poisoned lock")
            .get(&resource)
            .map(|log| log.records.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, resource: ResourceKind) -> bool {
        self.len(resource) == 0
    }
}

#[async_trait]
impl ChangeSource for MemoryChangeLog {
    async fn list(
        &self,
        resource: ResourceKind,
        after: Option<&Cursor>,
        limit: usize,
    ) -> Result<ChangeBatch, SourceError> {
        if let Some(after) = after {
            if after.resource() != resource {
                return Err(SourceError::other(format_args!(
                    "cursor for {} used to read {}", after.resource(), resource
                )))
            }
        }

        let logs = self.logs.lock().expect("poisoned lock");
        let log = logs.get(&resource).ok_or(SourceError::NoNewData)?;

        if let (Some(after), Some(dropped)) = (after, &log.dropped) {
            if after < dropped {
                return Err(SourceError::CursorExpired)
            }
        }

        let records: Vec<_> = log.records.iter()
            .filter(|r| after.map(|a| &r.cursor > a).unwrap_or(true))
            .take(limit.max(1))
            .cloned()
            .collect();

        match records.last() {
            Some(last) => {
                let next = last.cursor.clone();
                Ok(ChangeBatch { records, next })
            }
            None => Err(SourceError::NoNewData),
        }
    }

    async fn latest(
        &self, resource: ResourceKind
    ) -> Result<Option<Cursor>, SourceError> {
        Ok(
            self.logs.lock().expect("poisoned lock")
                .get(&resource)
                .and_then(|log| log.last.clone())
        )
    }
}


//------------ SubscriptionSource --------------------------------------------

/// All subscriptions as of a revision.
#[derive(Clone, Debug)]
pub struct SubscriptionList {
    pub subscriptions: Vec<Subscription>,
    pub revision: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SubscriptionChange {
    Upsert(Subscription),
    Delete(SubscriptionId),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubscriptionEvent {
    pub revision: u64,
    pub change: SubscriptionChange,
}

/// The persistent store of subscriber registrations.
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    async fn list(&self) -> Result<SubscriptionList, SourceError>;

    /// Returns the changes made after the given revision.
    ///
    /// Returns [`SourceError::CursorExpired`] if those are no longer
    /// available, the caller then has to list again.
    async fn watch(
        &self, since: u64
    ) -> Result<Vec<SubscriptionEvent>, SourceError>;
}


//------------ MemorySubscriptionStore ---------------------------------------

/// An in-process subscription store.
#[derive(Debug, Default)]
pub struct MemorySubscriptionStore {
    state: Mutex<StoreState>,
}

#[derive(Debug, Default)]
struct StoreState {
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    history: VecDeque<SubscriptionEvent>,
    revision: u64,
}

impl StoreState {
    fn record(&mut self, change: SubscriptionChange) {
        self.revision += 1;
        self.history.push_back(SubscriptionEvent {
            revision: self.revision,
            change,
        });
        while self.history.len() > SUBSCRIPTION_HISTORY {
            self.history.pop_front();
        }
    }
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding the given subscriptions.
    pub fn with_subscriptions(
        subscriptions: impl IntoIterator<Item = Subscription>
    ) -> EdResult<Self> {
        let store = Self::new();
        for sub in subscriptions {
            store.upsert(sub)?;
        }
        Ok(store)
    }

    /// Creates or replaces a subscription.
    ///
    /// The subscription is normalized and validated first.
    pub fn upsert(&self, mut sub: Subscription) -> EdResult<Subscription> {
        sub.normalize();
        sub.validate()?;

        let mut state = self.state.lock().expect("poisoned lock");
        if state.subscriptions.get(&sub.subscription_id) == Some(&sub) {
            return Ok(sub)
        }
        state.subscriptions.insert(sub.subscription_id, sub.clone());
        state.record(SubscriptionChange::Upsert(sub.clone()));
        Ok(sub)
    }

    pub fn delete(&self, id: SubscriptionId) -> EdResult<Subscription> {
        let mut state = self.state.lock().expect("poisoned lock");
        let sub = state.subscriptions.remove(&id)
            .ok_or(Error::SubscriptionUnknown(id))?;
        state.record(SubscriptionChange::Delete(id));
        Ok(sub)
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Subscription> {
        self.state.lock().expect("poisoned lock")
            .subscriptions.get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Subscription> {
        self.state.lock().expect("poisoned lock")
            .subscriptions.values().cloned().collect()
    }
}

#[async_trait]
impl SubscriptionSource for MemorySubscriptionStore {
    async fn list(&self) -> Result<SubscriptionList, SourceError> {
        let state = self.state.lock().expect("poisoned lock");
        Ok(SubscriptionList {
            subscriptions: state.subscriptions.values().cloned().collect(),
            revision: state.revision,
        })
    }

    async fn watch(
        &self, since: u64
    ) -> Result<Vec<SubscriptionEvent>, SourceError> {
        let state = self.state.lock().expect("poisoned lock");
        if let Some(first) = state.history.front() {
            if first.revision > since + 1 {
                return Err(SourceError::CursorExpired)
            }
        }
        Ok(
            state.history.iter()
                .filter(|event| event.revision > since)
                .cloned()
                .collect()
        )
    }
}


//------------ SourceError ---------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SourceError {
    /// Nothing follows the given cursor yet.
    NoNewData,

    /// The cursor points to data the source no longer retains.
    CursorExpired,

    Other(String),
}

impl SourceError {
    pub fn other(msg: impl fmt::Display) -> Self {
        SourceError::Other(msg.to_string())
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SourceError::NoNewData => f.write_str("no new data"),
            SourceError::CursorExpired => f.write_str("cursor expired"),
            SourceError::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for SourceError { }


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::test;

    #[tokio::test]
    async fn list_after_cursor() {
        let log = MemoryChangeLog::new();
        let host = ResourceKind::Host;

        assert_eq!(
            log.list(host, None, 10).await.unwrap_err(),
            SourceError::NoNewData
        );
        assert_eq!(log.latest(host).await.unwrap(), None);

        let time = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let first = log.append_at(host, time, Change::insert(json!({"id": 1})));
        let second = log.append_at(host, time, Change::insert(json!({"id": 2})));
        let third = log.append(host, Change::delete(json!({"id": 1})));
        assert!(first < second && second < third);
        assert_eq!(second.index(), 1);

        let batch = log.list(host, None, 2).await.unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.next, second);

        let batch = log.list(host, Some(&batch.next), 10).await.unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].change.operation, Operation::Delete);

        assert_eq!(
            log.list(host, Some(&third), 10).await.unwrap_err(),
            SourceError::NoNewData
        );
        assert_eq!(log.latest(host).await.unwrap(), Some(third));

        assert_eq!(
            log.list(ResourceKind::Biz, Some(&first), 10).await.unwrap_err(),
            SourceError::Other("cursor for host used to read biz".into())
        );
    }

    #[tokio::test]
    async fn earlier_time_does_not_move_cursor_back() {
        let log = MemoryChangeLog::new();
        let now = log.append(ResourceKind::Set, Change::insert(json!({})));
        let old = Utc.timestamp_opt(0, 0).unwrap();
        let next = log.append_at(
            ResourceKind::Set, old, Change::insert(json!({}))
        );
        assert!(next > now);

        let batch = log.list(ResourceKind::Set, Some(&now), 1).await.unwrap();
        assert_eq!(batch.records[0].time, old);
    }

    #[tokio::test]
    async fn retention_expires_old_cursors() {
        let log = MemoryChangeLog::with_retention(2);
        let host = ResourceKind::Host;
        let first = log.append(host, Change::insert(json!({"id": 1})));
        let second = log.append(host, Change::insert(json!({"id": 2})));
        log.append(host, Change::insert(json!({"id": 3})));
        log.append(host, Change::insert(json!({"id": 4})));

        assert_eq!(log.len(host), 2);
        assert_eq!(
            log.list(host, Some(&first), 10).await.unwrap_err(),
            SourceError::CursorExpired
        );
        assert_eq!(log.list(host, Some(&second), 10).await.unwrap().records.len(), 2);
        assert!(log.list(ResourceKind::Biz, Some(&second), 10).await.is_err());
    }

    #[tokio::test]
    async fn subscription_store_watch() {
        let store = MemorySubscriptionStore::new();
        let list = store.list().await.unwrap();
        assert!(list.subscriptions.is_empty());

        store.upsert(test::subscription(1, "http://localhost/", "hostcreate"))
            .unwrap();
        store.upsert(test::subscription(2, "http://localhost/", "hostdelete"))
            .unwrap();

        // unchanged upserts are not recorded
        store.upsert(test::subscription(2, "http://localhost/", "hostdelete"))
            .unwrap();

        let events = store.watch(list.revision).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].revision, 2);

        store.delete(1).unwrap();
        assert!(matches!(store.delete(1), Err(Error::SubscriptionUnknown(1))));

        let events = store.watch(2).await.unwrap();
        assert_eq!(
            events,
            vec![SubscriptionEvent {
                revision: 3, change: SubscriptionChange::Delete(1)
            }]
        );
        assert!(store.watch(3).await.unwrap().is_empty());
        assert_eq!(store.all().len(), 1);
    }

    #[test]
    fn subscription_store_rejects_invalid() {
        let store = MemorySubscriptionStore::new();
        let sub = test::subscription(1, "not a url", "hostcreate");
        assert!(store.upsert(sub).is_err());
        assert!(store.get(1).is_none());
    }
}

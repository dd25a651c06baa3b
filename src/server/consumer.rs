//! Turning change records into events.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, trace, warn};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::api::{
    Action, Cursor, Event, EventData, EventType, ResourceKind,
};
use crate::commons::error::Error;
use crate::commons::EdResult;

use super::ingest::EventIngestor;
use super::source::{ChangeRecord, ChangeSource, Operation, SourceError};
use super::stats::{Outcome, Stage};
use super::PipelineContext;

/// The document field naming the model of generic object instances.
const OBJECT_ID_FIELD: &str = "bk_obj_id";


//------------ ObjType -------------------------------------------------------

/// Where the object type of an event comes from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObjType {
    Fixed(&'static str),

    /// Taken from the named field of the document.
    Field(&'static str),
}


//------------ Translator ----------------------------------------------------

/// Translates the change records of one resource kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Translator {
    pub event_type: EventType,
    pub obj_type: ObjType,
}

impl Translator {
    const fn instdata(obj_type: ObjType) -> Self {
        Translator { event_type: EventType::InstData, obj_type }
    }

    const fn relation(obj_type: &'static str) -> Self {
        Translator {
            event_type: EventType::Relation,
            obj_type: ObjType::Fixed(obj_type),
        }
    }

    pub fn translate(
        &self, resource: ResourceKind, record: &ChangeRecord
    ) -> EdResult<Event> {
        let change = &record.change;
        let (action, data) = match change.operation {
            Operation::Insert => (Action::Create, EventData {
                cur_data: change.document.clone(),
                pre_data: Value::Null,
            }),
            Operation::Update => (Action::Update, EventData {
                cur_data: change.document.clone(),
                pre_data: change.pre_image.clone(),
            }),
            Operation::Delete => (Action::Delete, EventData {
                cur_data: Value::Null,
                pre_data: change.pre_image.clone(),
            }),
        };

        let obj_type = match self.obj_type {
            ObjType::Fixed(obj_type) => obj_type.to_string(),
            ObjType::Field(field) => {
                let doc = match action {
                    Action::Delete => &data.pre_data,
                    _ => &data.cur_data,
                };
                doc.get(field)
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .ok_or_else(|| Error::custom(format!(
                        "{resource} change at {} lacks '{field}'",
                        record.cursor
                    )))?
            }
        };

        Ok(Event {
            id: 0,
            resource,
            event_type: self.event_type,
            action,
            obj_type,
            cursor: record.cursor.encode(),
            action_time: record.time,
            data: vec![data],
            updated_fields: change.updated_fields.clone(),
            deleted_fields: change.deleted_fields.clone(),
        })
    }
}


//------------ Translators ---------------------------------------------------

/// The translators for all known resource kinds.
#[derive(Clone, Debug)]
pub struct Translators(HashMap<ResourceKind, Translator>);

impl Translators {
    pub fn standard() -> Self {
        use self::ObjType::{Field, Fixed};

        Translators(HashMap::from([
            (ResourceKind::Host, Translator::instdata(Fixed("host"))),
            (ResourceKind::HostRelation, Translator::relation("moduletransfer")),
            (ResourceKind::Biz, Translator::instdata(Fixed("biz"))),
            (ResourceKind::Set, Translator::instdata(Fixed("set"))),
            (ResourceKind::Module, Translator::instdata(Fixed("module"))),
            (ResourceKind::Process, Translator::instdata(Fixed("process"))),
            (
                ResourceKind::ProcessInstanceRelation,
                Translator::relation("processmodule")
            ),
            (
                ResourceKind::ObjectInstance,
                Translator::instdata(Field(OBJECT_ID_FIELD))
            ),
            (
                ResourceKind::MainlineInstance,
                Translator::instdata(Field(OBJECT_ID_FIELD))
            ),
        ]))
    }

    pub fn get(&self, resource: ResourceKind) -> Option<Translator> {
        self.0.get(&resource).copied()
    }

    /// Looks up a translator by the resource name used by the source.
    ///
    /// Unknown names yield `None`.
    pub fn lookup(&self, name: &str) -> Option<(ResourceKind, Translator)> {
        let resource = ResourceKind::from_str(name).ok()?;
        self.get(resource).map(|t| (resource, t))
    }
}

impl Default for Translators {
    fn default() -> Self {
        Self::standard()
    }
}


//------------ ChangeConsumer ------------------------------------------------

/// Follows the change stream of one resource kind.
pub struct ChangeConsumer {
    resource: ResourceKind,
    translator: Translator,
    source: Arc<dyn ChangeSource>,
    ingestor: EventIngestor,
    ctx: PipelineContext,

    /// The last record handled.
    cursor: Option<Cursor>,

    /// The cursor last written to the store.
    persisted: Option<Cursor>,

    resumed: bool,
}

impl ChangeConsumer {
    pub fn new(
        resource: ResourceKind,
        translator: Translator,
        source: Arc<dyn ChangeSource>,
        ingestor: EventIngestor,
        ctx: PipelineContext,
    ) -> Self {
        ChangeConsumer {
            resource,
            translator,
            source,
            ingestor,
            ctx,
            cursor: None,
            persisted: None,
            resumed: false,
        }
    }

    pub fn resource(&self) -> ResourceKind {
        self.resource
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    /// Determines where to start reading.
    ///
    /// This is the consumer's own persisted cursor, or else the oldest
    /// cursor confirmed to any subscriber for this resource, or else the
    /// head of the stream. Must only be called once the registry is
    /// loaded.
    pub async fn resume(&mut self) -> EdResult<()> {
        let cursor = match self.stored_cursor().await? {
            Some(cursor) => {
                debug!("{} resumes from its own cursor", self.resource);
                Some(cursor)
            }
            None => match self.oldest_subscriber_cursor().await? {
                Some(cursor) => {
                    debug!(
                        "{} resumes from oldest subscriber cursor",
                        self.resource
                    );
                    Some(cursor)
                }
                None => {
                    debug!("{} starts from now", self.resource);
                    self.source.latest(self.resource).await?
                }
            },
        };
        info!(
            "Change consumer for {} resumes at {}",
            self.resource,
            cursor.as_ref().map(|c| c.to_string()).unwrap_or_else(|| "start".into())
        );
        self.persisted = cursor.clone();
        self.cursor = cursor;
        self.resumed = true;
        Ok(())
    }

    async fn stored_cursor(&self) -> EdResult<Option<Cursor>> {
        let key = self.ctx.keys.resource_cursor(self.resource);
        match self.ctx.store.get(&key).await? {
            Some(value) => match Cursor::from_str(&value) {
                Ok(cursor) if cursor.resource() == self.resource => {
                    Ok(Some(cursor))
                }
                _ => {
                    warn!("Ignoring invalid cursor '{value}' in {key}");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn oldest_subscriber_cursor(&self) -> EdResult<Option<Cursor>> {
        let mut cursors = Vec::new();
        for sub in self.ctx.registry.subscriptions() {
            for event_key in sub.event_keys() {
                let key = self.ctx.keys.subscriber_cursor(
                    &event_key, sub.subscription_id
                );
                if let Some(value) = self.ctx.store.get(&key).await? {
                    if let Ok(cursor) = Cursor::from_str(&value) {
                        if cursor.resource() == self.resource {
                            cursors.push(cursor);
                        }
                    }
                }
            }
        }
        Ok(Cursor::oldest(&cursors).cloned())
    }

    async fn persist_cursor(&mut self) -> EdResult<()> {
        if self.cursor == self.persisted {
            return Ok(())
        }
        if let Some(cursor) = &self.cursor {
            self.ctx.store.set(
                &self.ctx.keys.resource_cursor(self.resource),
                &cursor.encode(),
                None,
            ).await?;
            self.persisted = Some(cursor.clone());
        }
        Ok(())
    }

    /// Reads and handles one batch of changes.
    ///
    /// Returns the number of events queued.
    pub async fn poll(&mut self) -> EdResult<usize> {
        let batch = self.source.list(
            self.resource,
            self.cursor.as_ref(),
            self.ctx.config.watch_batch_size,
        ).await?;

        let mut queued = 0;
        let mut res = Ok(());
        for record in batch.records {
            let started = Instant::now();
            match self.handle(&record).await {
                Ok(outcome) => {
                    if outcome == Outcome::Success {
                        queued += 1;
                    }
                    self.ctx.metrics.observe(
                        Stage::Consume, outcome, started.elapsed()
                    );
                    self.cursor = Some(record.cursor);
                }
                Err(e) => {
                    self.ctx.metrics.count(Stage::Consume, Outcome::Failure);
                    res = Err(e);
                    break
                }
            }
        }

        self.persist_cursor().await?;
        res.map(|_| queued)
    }

    /// Handles a single record.
    ///
    /// Only failing to queue the event is an error, the record will then
    /// be read again.
    async fn handle(&self, record: &ChangeRecord) -> EdResult<Outcome> {
        let event = match self.translator.translate(self.resource, record) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping change record: {e}");
                return Ok(Outcome::Failure)
            }
        };

        let key = event.key();
        if !self.ctx.registry.is_subscribed(&key) {
            trace!("No subscribers for {key}, skipping {}", record.cursor);
            return Ok(Outcome::Skipped)
        }

        let event = match self.ctx.registry.wanted_fields(&key) {
            Some(fields) => event.project(&fields),
            None => event,
        };
        let id = self.ingestor.enqueue(event).await?;
        debug!("Ingested {key} event {id} from {}", record.cursor);
        Ok(Outcome::Success)
    }

    /// Continues from the head of the stream.
    async fn restart_from_head(&mut self) -> EdResult<()> {
        self.cursor = self.source.latest(self.resource).await?;
        self.persist_cursor().await
    }

    /// Follows the stream until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Change consumer for {} started", self.resource);
        let retry = self.ctx.config.watch_retry_interval();

        loop {
            if !self.ctx.wait_for_leadership(&cancel).await {
                break
            }
            if !self.resumed {
                if let Err(e) = self.resume().await {
                    warn!("Change consumer for {} cannot resume: {e}", self.resource);
                    if !self.ctx.pause(retry, &cancel).await {
                        break
                    }
                    continue
                }
            }

            let res = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.poll() => res,
            };

            let pause = match res {
                Ok(_) => false,
                Err(Error::SourceError(SourceError::NoNewData)) => true,
                Err(Error::SourceError(SourceError::CursorExpired)) => {
                    warn!(
                        "Cursor of {} expired, continuing from head",
                        self.resource
                    );
                    if let Err(e) = self.restart_from_head().await {
                        warn!("Cannot restart {} from head: {e}", self.resource);
                    }
                    true
                }
                Err(e) => {
                    warn!("Change consumer for {} failed: {e}", self.resource);
                    true
                }
            };

            if !self.ctx.leader.is_leader().await {
                // Another replica may move the cursor while we wait.
                self.resumed = false;
            }

            if pause && !self.ctx.pause(retry, &cancel).await {
                break
            }
        }
        info!("Change consumer for {} stopped", self.resource);
    }
}


//------------ Tests ---------------------------------------------------------

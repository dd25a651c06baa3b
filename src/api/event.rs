//! Domain events produced from change records.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::commons::error::Error;


//------------ ResourceKind --------------------------------------------------

/// The kinds of resources whose changes are watched.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Host,
    HostRelation,
    Biz,
    Set,
    Module,
    Process,
    ProcessInstanceRelation,
    ObjectInstance,
    MainlineInstance,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 9] = [
        ResourceKind::Host,
        ResourceKind::HostRelation,
        ResourceKind::Biz,
        ResourceKind::Set,
        ResourceKind::Module,
        ResourceKind::Process,
        ResourceKind::ProcessInstanceRelation,
        ResourceKind::ObjectInstance,
        ResourceKind::MainlineInstance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Host => "host",
            ResourceKind::HostRelation => "host_relation",
            ResourceKind::Biz => "biz",
            ResourceKind::Set => "set",
            ResourceKind::Module => "module",
            ResourceKind::Process => "process",
            ResourceKind::ProcessInstanceRelation => {
                "process_instance_relation"
            }
            ResourceKind::ObjectInstance => "object_instance",
            ResourceKind::MainlineInstance => "mainline_instance",
        }
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::UnknownResource(s.to_string()))
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


//------------ EventType -----------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum EventType {
    #[serde(rename = "instdata")]
    InstData,
    #[serde(rename = "relation")]
    Relation,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            EventType::InstData => "instdata",
            EventType::Relation => "relation",
        })
    }
}


//------------ Action --------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub const ALL: [Action; 3] = [Action::Create, Action::Update, Action::Delete];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


//------------ EventKey ------------------------------------------------------

/// Returns the key subscriptions use to match events.
///
/// Instance data events are matched on object type and action, e.g.
/// `hostcreate`. Relation events are matched on object type alone, e.g.
/// `moduletransfer`.
pub fn event_key(event_type: EventType, obj_type: &str, action: Action) -> String {
    match event_type {
        EventType::InstData => format!("{obj_type}{action}"),
        EventType::Relation => obj_type.to_string(),
    }
}


//------------ EventData -----------------------------------------------------

/// Snapshot of a document before and after the change.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct EventData {
    #[serde(default)]
    pub cur_data: Value,

    #[serde(default)]
    pub pre_data: Value,
}

impl EventData {
    fn project(&self, fields: &BTreeSet<String>) -> Self {
        EventData {
            cur_data: project_value(&self.cur_data, fields),
            pre_data: project_value(&self.pre_data, fields),
        }
    }
}

/// Keeps only the named fields of a JSON object.
///
/// Anything that is not an object is passed on unchanged.
fn project_value(value: &Value, fields: &BTreeSet<String>) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| fields.contains(k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        ),
        other => other.clone(),
    }
}


//------------ Event ---------------------------------------------------------

/// A normalized change notification.
///
/// Events are immutable once translated. They travel through the main
/// queue as JSON.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Event {
    /// Diagnostics id from the event id counter.
    #[serde(rename = "event_id")]
    pub id: i64,

    pub resource: ResourceKind,
    pub event_type: EventType,
    pub action: Action,
    pub obj_type: String,

    /// Position of the originating change record in its stream.
    pub cursor: String,

    pub action_time: DateTime<Utc>,
    pub data: Vec<EventData>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updated_fields: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_fields: Vec<String>,
}

impl Event {
    /// Returns the key used to match this event against subscriptions.
    pub fn key(&self) -> String {
        event_key(self.event_type, &self.obj_type, self.action)
    }

    /// Returns whether this event is too old to still be delivered.
    pub fn is_fused(&self, now: DateTime<Utc>, expire: Duration) -> bool {
        let age = now.signed_duration_since(self.action_time);
        match age.to_std() {
            Ok(age) => age > expire,
            // action time lies in the future
            Err(_) => false,
        }
    }

    /// Returns a copy with the payload cut down to the given fields.
    ///
    /// An empty field set means the whole document is wanted.
    pub fn project(&self, fields: &BTreeSet<String>) -> Event {
        if fields.is_empty() {
            return self.clone()
        }
        Event {
            data: self.data.iter().map(|d| d.project(fields)).collect(),
            updated_fields: self.updated_fields.iter()
                .filter(|f| fields.contains(f.as_str()))
                .cloned()
                .collect(),
            deleted_fields: self.deleted_fields.iter()
                .filter(|f| fields.contains(f.as_str()))
                .cloned()
                .collect(),
            ..self.clone()
        }
    }

    /// Serializes the event for the main queue.
    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(Error::JsonError)
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(Error::JsonError)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn host_event(action: Action, secs: i64) -> Event {
        Event {
            id: 1,
            resource: ResourceKind::Host,
            event_type: EventType::InstData,
            action,
            obj_type: "host".into(),
            cursor: String::new(),
            action_time: Utc.timestamp_opt(secs, 0).unwrap(),
            data: vec![EventData {
                cur_data: json!({
                    "bk_host_id": 1, "bk_host_innerip": "10.0.0.1",
                    "bk_cloud_id": 0
                }),
                pre_data: Value::Null,
            }],
            updated_fields: vec!["bk_host_innerip".into(), "bk_cloud_id".into()],
            deleted_fields: vec![],
        }
    }

    #[test]
    fn event_keys() {
        assert_eq!(
            event_key(EventType::InstData, "host", Action::Create),
            "hostcreate"
        );
        assert_eq!(
            event_key(EventType::Relation, "moduletransfer", Action::Update),
            "moduletransfer"
        );
        assert_eq!(host_event(Action::Delete, 0).key(), "hostdelete");
    }

    #[test]
    fn resource_kind_names() {
        for kind in ResourceKind::ALL {
            assert_eq!(ResourceKind::from_str(kind.as_str()).unwrap(), kind);
        }
        assert!(ResourceKind::from_str("nonsense").is_err());
        assert_eq!(
            serde_json::to_string(&ResourceKind::HostRelation).unwrap(),
            "\"host_relation\""
        );
    }

    #[test]
    fn fused_after_expiry() {
        let event = host_event(Action::Create, 1_000_000);
        let expire = Duration::from_secs(3 * 3600);
        let now = Utc.timestamp_opt(1_000_000 + 3 * 3600, 0).unwrap();
        assert!(!event.is_fused(now, expire));
        let now = Utc.timestamp_opt(1_000_000 + 3 * 3600 + 1, 0).unwrap();
        assert!(event.is_fused(now, expire));
        let past = Utc.timestamp_opt(0, 0).unwrap();
        assert!(!event.is_fused(past, expire));
    }

    #[test]
    fn project_cuts_payload() {
        let event = host_event(Action::Update, 0);
        let fields: BTreeSet<String> =
            ["bk_host_id", "bk_cloud_id"].iter().map(|s| s.to_string()).collect();

        let projected = event.project(&fields);
        assert_eq!(
            projected.data[0].cur_data,
            json!({"bk_host_id": 1, "bk_cloud_id": 0})
        );
        assert_eq!(projected.data[0].pre_data, Value::Null);
        assert_eq!(projected.updated_fields, vec!["bk_cloud_id".to_string()]);

        assert_eq!(event.project(&BTreeSet::new()), event);
    }

    #[test]
    fn survives_queue_json() {
        let event = host_event(Action::Create, 1_700_000_000);
        let json = event.to_json().unwrap();
        assert!(json.contains("\"event_type\":\"instdata\""));
        assert!(json.contains("\"action\":\"create\""));
        assert_eq!(Event::from_json(&json).unwrap(), event);
    }
}

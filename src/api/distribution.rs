//! Delivery units queued per subscriber.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::commons::error::Error;

use super::event::{Event, EventData};
use super::subscription::SubscriptionId;


//------------ DistributionRecord --------------------------------------------

/// One event on its way to one subscriber.
///
/// The distribution id is taken from the subscriber's counter when the
/// record is queued, so ids within one subscriber queue strictly increase
/// in queue order.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DistributionRecord {
    pub event: Event,
    pub distribution_id: i64,
    pub subscription_id: SubscriptionId,
}

impl DistributionRecord {
    pub fn new(
        event: Event,
        distribution_id: i64,
        subscription_id: SubscriptionId,
    ) -> Self {
        DistributionRecord { event, distribution_id, subscription_id }
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(Error::JsonError)
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(Error::JsonError)
    }

    /// Builds the body posted to the subscriber.
    pub fn callback_body<'a>(
        &'a self,
        request_id: &'a str,
        supplier_account: &'a str,
    ) -> CallbackBody<'a> {
        CallbackBody {
            event_id: self.event.id,
            event_type: self.event.event_type.to_string(),
            action: self.event.action.as_str(),
            action_time: rfc3339(self.event.action_time),
            obj_type: &self.event.obj_type,
            data: &self.event.data,
            distribution_id: self.distribution_id,
            subscription_id: self.subscription_id,
            request_id,
            supplier_account,
        }
    }
}

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}


//------------ CallbackBody --------------------------------------------------

/// The JSON body of a subscriber callback.
#[derive(Clone, Debug, Serialize)]
pub struct CallbackBody<'a> {
    pub event_id: i64,
    pub event_type: String,
    pub action: &'a str,
    pub action_time: String,
    pub obj_type: &'a str,
    pub data: &'a [EventData],
    pub distribution_id: i64,
    pub subscription_id: SubscriptionId,
    pub request_id: &'a str,
    pub supplier_account: &'a str,
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::{json, Value};

    use super::*;
    use crate::api::event::{Action, EventType, ResourceKind};

    #[test]
    fn callback_body_has_the_documented_shape() {
        let event = Event {
            id: 42,
            resource: ResourceKind::HostRelation,
            event_type: EventType::Relation,
            action: Action::Create,
            obj_type: "moduletransfer".into(),
            cursor: "abc".into(),
            action_time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            data: vec![EventData {
                cur_data: json!({"bk_host_id": 1, "bk_module_id": 2}),
                pre_data: Value::Null,
            }],
            updated_fields: vec![],
            deleted_fields: vec![],
        };
        let record = DistributionRecord::new(event, 3, 9);
        let body = serde_json::to_value(
            record.callback_body("req-1", "0")
        ).unwrap();

        assert_eq!(body, json!({
            "event_id": 42,
            "event_type": "relation",
            "action": "create",
            "action_time": "2024-05-01T12:00:00Z",
            "obj_type": "moduletransfer",
            "data": [{
                "cur_data": {"bk_host_id": 1, "bk_module_id": 2},
                "pre_data": null
            }],
            "distribution_id": 3,
            "subscription_id": 9,
            "request_id": "req-1",
            "supplier_account": "0"
        }));

        let json = record.to_json().unwrap();
        assert_eq!(DistributionRecord::from_json(&json).unwrap(), record);
    }
}

//! Data structures shared by the pipeline and its admin API.

pub mod cursor;
pub mod distribution;
pub mod event;
pub mod subscription;

pub use self::cursor::Cursor;
pub use self::distribution::{CallbackBody, DistributionRecord};
pub use self::event::{
    event_key, Action, Event, EventData, EventType, ResourceKind,
};
pub use self::subscription::{
    ConfirmError, ConfirmMode, Subscription, SubscriptionId,
};

//! Change notification subsystem
//!
//! Transactions collect events in a [`NotificationCollector`]; on commit the
//! events are stamped, journaled for [`RecorderRegistry`] subscribers and
//! published on the [`NotificationBus`] to live monitors.

mod bus;
mod collector;
mod event;
mod filter;
mod recorder;

pub use bus::{Monitor, NotificationBus, NotificationSink, SubscriberId};
pub use collector::NotificationCollector;
pub use event::{
    Change, CollectionChange, CollectionOperation, EntityKind, ItemChange, ItemOperation,
    NotifiedItem, Notification, RelationChange, RelationOperation, TagChange, TagOperation,
};
pub use filter::MonitorFilter;
pub use recorder::{RecorderRegistry, last_committed_sequence};

//! Per-resource synchronization scheduling
//!
//! Every resource has one task queue; at most one task runs per resource.
//! Duplicate requests merge into the queued or running task, interactive
//! fetches jump the queue and a watchdog fails stalled tasks.

mod manager;
mod resource;
mod retriever;

pub use manager::{ResourceAdapter, ResourceManager, ResourceStatus};
pub use resource::{
    ResourceScheduler, ResourceState, Scheduled, TaskKind, TaskOutcome, TaskRequest,
    backoff_delay,
};
pub use retriever::ItemRetriever;

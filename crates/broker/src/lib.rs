//! Broker crate - storage and change broker for personal information data
//!
//! This crate provides the server side of the meridian protocol:
//! - Domain models (Collection, Item, Part, Tag, Relation)
//! - Transactional SQLite storage with external part files
//! - Change notifications for live monitors and durable recorders
//! - Per-resource task scheduling and on-demand payload retrieval
//! - Cache policy enforcement (expiry sweep and interval sync)
//! - Full-text search and persistent searches as virtual collections
//! - Wire protocol codec and the TCP server that drives it
//!
//! Resource adapters and clients talk to the broker over the wire protocol
//! only; nothing in here knows about a particular data source.

pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod notify;
pub mod protocol;
pub mod scheduler;
pub mod search;
pub mod server;
pub mod service;
pub mod storage;

pub use config::{BrokerConfig, ResourceEntry, ResourceManifest};
pub use error::{BrokerError, ErrorKind};
pub use models::{
    CachePolicy, Collection, CollectionChanges, CollectionId, Item, ItemChanges, ItemId, Part,
    Relation, Tag, TagId,
};
pub use notify::{MonitorFilter, Notification, NotificationBus};
pub use scheduler::{ResourceAdapter, ResourceManager, TaskRequest};
pub use search::{ItemIndex, SearchManager, SearchProvider};
pub use server::{Dispatcher, Server};
pub use service::Broker;
pub use storage::{Store, Transaction};

//! Command dispatcher
//!
//! One [`Dispatcher`] per connection turns decoded frames into typed
//! commands and runs each handler inside its own storage transaction. Data
//! responses go straight to the connection's outbox as they are produced,
//! so large results stream instead of being buffered. Handlers block, so
//! the listener calls [`Dispatcher::handle_frame`] on a blocking thread.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use super::session::{ConnectionState, Session};
use crate::error::{BrokerError, ErrorKind};
use crate::models::{
    Collection, CollectionChanges, CollectionId, Item, ItemChanges, ItemId, Relation, SearchSpec,
    TagChanges, TagId, parts,
};
use crate::notify::{MonitorFilter, Notification, NotificationSink};
use crate::protocol::command::SyncTarget;
use crate::protocol::{
    CollectionScope, Command, CreateOptions, DecodeError, Depth, FetchScope, Frame, ItemScope,
    ListOptions, NewItem, Response, SearchScope, UidSet, Value, encode,
};
use crate::scheduler::{ResourceAdapter, Scheduled, TaskKind, TaskRequest};
use crate::service::Broker;
use crate::storage::{CollectionFilter, ItemFilter, RelationFilter, SEARCH_RESOURCE, Transaction};

/// Responses queued for the connection's writer
pub type Outbox = mpsc::UnboundedSender<Response>;

const CAPABILITIES: &[&str] = &["MERIDIAN1", "LITERAL+", "MONITOR", "RECORDER", "SEARCH"];

/// Forwards bus events to a monitoring connection
struct MonitorSink(Outbox);

impl NotificationSink for MonitorSink {
    fn deliver(&self, notification: &Arc<Notification>) -> bool {
        let mut values = vec![Value::atom("NOTIFY")];
        values.extend(encode::notification(notification));
        self.0.send(Response::Data(values)).is_ok()
    }
}

/// Hands scheduled tasks to an adapter connected over the wire
struct ConnectionAdapter(Outbox);

impl ResourceAdapter for ConnectionAdapter {
    fn dispatch(&self, task: &TaskRequest) -> bool {
        self.0.send(Response::Data(encode::task(task))).is_ok()
    }
}

pub struct Dispatcher {
    broker: Arc<Broker>,
    outbox: Outbox,
    session: Session,
}

impl Dispatcher {
    pub fn new(broker: Arc<Broker>, connection_id: u64, outbox: Outbox) -> Self {
        Self {
            broker,
            outbox,
            session: Session::new(connection_id),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Whether the connection should be closed after the queued responses
    pub fn is_closing(&self) -> bool {
        self.session.logged_out
    }

    fn send(&self, values: Vec<Value>) {
        // a closed outbox means the peer is gone; the reader notices
        let _ = self.outbox.send(Response::Data(values));
    }

    fn finish(&mut self, response: Response) {
        self.session.state = ConnectionState::RespondingDone;
        let _ = self.outbox.send(response);
        self.session.state = ConnectionState::AwaitingCommand;
    }

    /// Parse and execute one request; always queues exactly one tagged
    /// completion
    pub fn handle_frame(&mut self, frame: Frame) {
        self.session.state = ConnectionState::Parsing;
        let tag = frame.tag.clone();
        let command = match Command::parse(&frame) {
            Ok(command) => command,
            Err(e) => {
                debug!("{}: rejected {} {}: {:#}", self.session, tag, frame.name, e);
                self.finish(Response::failure(tag, ErrorKind::classify(&e), format!("{:#}", e)));
                return;
            }
        };
        if !self.session.is_authenticated() && !command.allowed_before_login() {
            self.finish(Response::failure(
                tag,
                ErrorKind::Constraint,
                "LOGIN required",
            ));
            return;
        }

        self.session.state = ConnectionState::Executing;
        let response = match self.execute(command) {
            Ok(text) => Response::ok(tag, text),
            Err(e) => {
                let kind = ErrorKind::classify(&e);
                if kind == ErrorKind::Fatal {
                    warn!("{}: {} {} failed fatally: {:#}", self.session, tag, frame.name, e);
                } else {
                    debug!("{}: {} {} failed: {:#}", self.session, tag, frame.name, e);
                }
                Response::failure(tag, kind, format!("{:#}", e))
            }
        };
        self.finish(response);
    }

    /// Answer a frame the decoder could not read
    pub fn handle_invalid(&mut self, error: DecodeError) {
        let tag = error.tag.unwrap_or_else(|| "*".to_string());
        self.finish(Response::bad(tag, error.reason));
    }

    /// Release the monitor subscription and adapter registration
    pub fn close(&mut self) {
        if let Some(id) = self.session.monitor.take() {
            if let Err(e) = self.broker.store().bus().unsubscribe(id) {
                warn!("{}: failed to drop monitor: {:#}", self.session, e);
            }
        }
        if let Some(resource) = self.session.adapter_for.take() {
            if let Err(e) = self
                .broker
                .resources()
                .adapter_disconnected(&resource, self.session.connection_id())
            {
                warn!("{}: failed to detach adapter of {}: {:#}", self.session, resource, e);
            }
        }
    }

    fn execute(&mut self, command: Command) -> Result<String> {
        match command {
            Command::Login { session } => self.login(session),
            Command::Logout => {
                self.session.logged_out = true;
                self.send_bye("Meridian logging out");
                Ok("LOGOUT completed".to_string())
            }
            Command::Capability => {
                let mut values = vec![Value::atom("CAPABILITY")];
                values.extend(CAPABILITIES.iter().map(|c| Value::atom(*c)));
                self.send(values);
                Ok("CAPABILITY completed".to_string())
            }
            Command::SelectResource { resource } => {
                let text = match &resource {
                    Some(name) => format!("Selected resource {}", name),
                    None => "Resource deselected".to_string(),
                };
                self.session.selected_resource = resource;
                Ok(text)
            }
            Command::List {
                scope,
                depth,
                options,
            } => self.list(&scope, depth, &options),
            Command::Fetch { scope, fetch } => self.fetch(&scope, &fetch),
            Command::Append {
                collection,
                item,
                merge,
            } => self.append(&collection, item, merge),
            Command::Store {
                scope,
                revision,
                changes,
            } => self.store(&scope, revision, &changes),
            Command::Move { scope, destination } => self.move_items(&scope, &destination),
            Command::Copy { scope, destination } => self.copy_items(&scope, &destination),
            Command::Remove { scope } => self.remove_items(&scope),
            Command::Create {
                name,
                parent,
                options,
            } => self.create(&name, &parent, &options),
            Command::Modify { scope, changes } => self.modify(&scope, &changes),
            Command::Delete { scope } => self.delete(&scope),
            Command::Rename {
                scope,
                name,
                parent,
            } => self.rename(&scope, &name, parent.as_ref()),
            Command::CollectionMove { scope, parent } => self.collection_move(&scope, &parent),
            Command::CollectionCopy { scope, parent } => self.collection_copy(&scope, &parent),
            Command::Subscribe { scopes, subscribe } => self.subscribe(&scopes, subscribe),
            Command::Link {
                collection,
                scope,
                link,
            } => self.link(&collection, &scope, link),
            Command::TagAppend { changes } => self.tag_append(&changes),
            Command::TagFetch { ids } => self.tag_fetch(ids.as_ref()),
            Command::TagStore { id, changes } => self.tag_store(id, &changes),
            Command::TagRemove { id } => self.tag_remove(id),
            Command::RelationModify { relation } => self.relation_modify(&relation),
            Command::RelationRemove {
                left,
                right,
                relation_type,
            } => self.relation_remove(left, right, relation_type.as_deref()),
            Command::RelationFetch {
                left,
                right,
                side,
                types,
            } => self.relation_fetch(RelationFilter {
                left,
                right,
                side,
                types,
            }),
            Command::Search { query, scope } => self.search(query, scope),
            Command::SearchPersistent { name, query, scope } => {
                self.search_persistent(&name, query, scope)
            }
            Command::Monitor { filter } => self.monitor(filter),
            Command::RecorderRegister { name, filter } => {
                self.broker.store().register_recorder(&name, filter)?;
                let pending = self.broker.store().pending_changes(&name)?;
                Ok(format!("Recorder {} registered, {} pending", name, pending))
            }
            Command::RecorderNext { name } => self.recorder_next(&name),
            Command::RecorderAck { name, sequence } => {
                self.broker.store().mark_processed(&name, sequence)?;
                Ok(format!("Change {} processed", sequence))
            }
            Command::RecorderRemove { name } => {
                if !self.broker.store().unregister_recorder(&name)? {
                    return Err(BrokerError::not_found("Recorder", &name).into());
                }
                Ok(format!("Recorder {} removed", name))
            }
            Command::ResourceSync { resource, target } => self.resource_sync(&resource, &target),
            Command::ResourceState { resource, online } => {
                let dropped = self.broker.resources().set_online(&resource, online)?;
                info!(
                    "{}: resource {} is now {}",
                    self.session,
                    resource,
                    if online { "online" } else { "offline" }
                );
                Ok(format!("{} queued tasks dropped", dropped))
            }
            Command::ResourceRegister { resource } => self.resource_register(resource),
            Command::TaskHeartbeat { serial } => {
                let resource = self.adapter_resource()?;
                if !self.broker.resources().heartbeat(&resource, serial)? {
                    return Err(BrokerError::constraint(format!("Task {} is not running", serial)).into());
                }
                Ok("Heartbeat recorded".to_string())
            }
            Command::TaskDone { serial, error } => {
                let resource = self.adapter_resource()?;
                if !self.broker.resources().task_done(&resource, serial, error)? {
                    return Err(BrokerError::constraint(format!("Task {} is not running", serial)).into());
                }
                Ok(format!("Task {} done", serial))
            }
            Command::ReplayChanges { resource } => {
                let scheduled = self
                    .broker
                    .resources()
                    .synchronize(&resource, TaskKind::ChangeReplay)?;
                scheduled_text(&resource, scheduled)
            }
        }
    }

    /// Queue an untagged BYE ahead of closing the connection
    pub fn send_bye(&self, text: &str) {
        let _ = self.outbox.send(Response::Bye(text.to_string()));
    }

    fn login(&mut self, name: String) -> Result<String> {
        if name.trim().is_empty() {
            return Err(BrokerError::syntax("Empty session name").into());
        }
        info!("conn-{} logged in as {}", self.session.connection_id(), name);
        let text = format!("Logged in as {}", name);
        self.session.login(name);
        Ok(text)
    }

    fn selected_resource(&self) -> Result<&str> {
        self.session.selected_resource.as_deref().ok_or_else(|| {
            BrokerError::syntax("Remote id scopes need a selected resource").into()
        })
    }

    fn adapter_resource(&self) -> Result<String> {
        self.session
            .adapter_for
            .clone()
            .ok_or_else(|| BrokerError::constraint("Connection is not a resource adapter").into())
    }

    /// Resolve a scope that must name an existing collection
    fn collection(&self, tx: &Transaction<'_>, scope: &CollectionScope) -> Result<Collection> {
        match scope {
            CollectionScope::Id(id) if id.0 == 0 => {
                Err(BrokerError::constraint("The top level is not a collection").into())
            }
            CollectionScope::Id(id) => tx.require_collection(*id),
            CollectionScope::RemoteId(remote_id) => {
                let resource = self.selected_resource()?;
                tx.collection_by_remote_id(resource, remote_id, None)?
                    .ok_or_else(|| BrokerError::not_found("Collection with remote id", remote_id).into())
            }
            CollectionScope::HierarchicalRemoteId(chain) => {
                let resource = self.selected_resource()?;
                tx.collection_by_hrid(resource, chain)?.ok_or_else(|| {
                    BrokerError::not_found("Collection with remote id chain", chain.join("/")).into()
                })
            }
            CollectionScope::Path(path) => tx
                .collection_by_path(self.session.selected_resource.as_deref(), path)?
                .ok_or_else(|| BrokerError::not_found("Collection path", path).into()),
        }
    }

    /// Resolve a parent scope; `None` is the top level
    fn parent(&self, tx: &Transaction<'_>, scope: &CollectionScope) -> Result<Option<CollectionId>> {
        if scope.is_top() {
            return Ok(None);
        }
        Ok(Some(self.collection(tx, scope)?.id))
    }

    fn items(&self, tx: &Transaction<'_>, scope: &ItemScope) -> Result<Vec<Item>> {
        match scope {
            ItemScope::Uids(set) => tx.items(&ItemFilter::ranges(set.ranges.clone())),
            ItemScope::RemoteId {
                remote_id,
                collection: Some(collection),
            } => {
                let collection = self.collection(tx, collection)?;
                Ok(tx
                    .item_by_remote_id(collection.id, remote_id)?
                    .into_iter()
                    .collect())
            }
            ItemScope::RemoteId {
                remote_id,
                collection: None,
            } => {
                let resource = self.selected_resource()?;
                tx.items(&ItemFilter::default().with_remote_id(resource, remote_id.as_str()))
            }
            ItemScope::Collection { scope, depth } => {
                let base = self.collection(tx, scope)?;
                let collections = tx.subtree(Some(base.id), *depth, &CollectionFilter::default())?;
                tx.items(&ItemFilter::in_collections(&collections))
            }
        }
    }

    /// Like [`Self::items`] but an empty match is an error
    fn require_items(&self, tx: &Transaction<'_>, scope: &ItemScope) -> Result<Vec<Item>> {
        let items = self.items(tx, scope)?;
        if items.is_empty() {
            return Err(BrokerError::constraint("No items match the scope").into());
        }
        Ok(items)
    }

    fn send_collection(
        &self,
        collection: &Collection,
        chain: Option<&[Collection]>,
        statistics: Option<crate::models::CollectionStatistics>,
    ) {
        let mut values = vec![Value::atom("COLLECTION")];
        values.extend(encode::collection(collection, chain, statistics));
        self.send(values);
    }

    fn send_item(&self, item: &Item, item_parts: &[crate::models::Part], chain: Option<&[Collection]>) {
        let mut values = vec![Value::atom("ITEM")];
        values.extend(encode::item(item, item_parts, chain));
        self.send(values);
    }

    fn list(&self, scope: &CollectionScope, depth: Depth, options: &ListOptions) -> Result<String> {
        let tx = self.broker.store().begin_read(&self.session.name())?;
        let base = self.parent(&tx, scope)?;
        let filter = CollectionFilter {
            resource: options.resource.clone(),
            mime_types: options.mime_types.clone(),
        };
        let collections = tx.subtree(base, depth, &filter)?;
        for collection in &collections {
            let chain = match options.ancestors {
                Depth::Base => None,
                depth => Some(tx.ancestors(collection, depth)?),
            };
            let statistics = if options.statistics {
                Some(tx.collection_statistics(collection)?)
            } else {
                None
            };
            self.send_collection(collection, chain.as_deref(), statistics);
        }
        tx.rollback()?;
        Ok(format!("LIST completed, {} collections", collections.len()))
    }

    /// Schedule a sync of a collection being fetched when its policy asks
    fn sync_on_demand(&self, tx: &Transaction<'_>, scope: &CollectionScope) -> Result<()> {
        let collection = self.collection(tx, scope)?;
        let policy = tx.effective_cache_policy(&collection)?;
        if self
            .broker
            .interval()
            .sync_on_demand(&collection, &policy, Utc::now())?
        {
            debug!("Synchronizing collection {} on demand", collection.id);
        }
        Ok(())
    }

    /// Have the owning resource deliver missing parts, blocking until it
    /// reports back
    fn retrieve(&self, resource: &str, items: BTreeSet<ItemId>, wanted: BTreeSet<String>) -> Result<()> {
        if resource == SEARCH_RESOURCE {
            return Ok(());
        }
        let connected = self
            .broker
            .resources()
            .status(resource)?
            .is_some_and(|s| s.connected);
        if !connected {
            return Err(BrokerError::unavailable(format!(
                "Resource {} has no connected adapter",
                resource
            ))
            .into());
        }
        self.broker.retriever().retrieve(resource, items, wanted)
    }

    fn fetch(&self, scope: &ItemScope, fetch: &FetchScope) -> Result<String> {
        let store = self.broker.store();
        let name = self.session.name();
        let wanted = fetch.requested_payload();

        // first pass: resolve and find what the cache lacks
        let mut requests: BTreeMap<String, (BTreeSet<ItemId>, BTreeSet<String>)> = BTreeMap::new();
        let ids: Vec<ItemId> = {
            let tx = store.begin_read(&name)?;
            let mut items = self.items(&tx, scope)?;
            if let Some(since) = fetch.changed_since {
                items.retain(|item| item.mtime >= since);
            }
            if let ItemScope::Collection {
                scope,
                depth: Depth::Base,
            } = scope
            {
                self.sync_on_demand(&tx, scope)?;
            }
            if !wanted.is_empty() && !fetch.cache_only {
                let mut owners: HashMap<CollectionId, String> = HashMap::new();
                for item in &items {
                    let missing = tx.missing_parts(item.id, &wanted)?;
                    if missing.is_empty() {
                        continue;
                    }
                    let resource = match owners.get(&item.collection_id) {
                        Some(resource) => resource.clone(),
                        None => {
                            let resource = tx.require_collection(item.collection_id)?.resource;
                            owners.insert(item.collection_id, resource.clone());
                            resource
                        }
                    };
                    let (ids, names) = requests.entry(resource).or_default();
                    ids.insert(item.id);
                    names.extend(missing);
                }
            }
            tx.rollback()?;
            items.iter().map(|item| item.id).collect()
        };

        // retrieval happens outside any transaction
        let mut skipped = BTreeSet::new();
        for (resource, (items, missing)) in requests {
            if let Err(e) = self.retrieve(&resource, items.clone(), missing) {
                if !fetch.ignore_errors {
                    return Err(e.context(format!("Cannot retrieve payload from {}", resource)));
                }
                warn!("{}: skipping {} items of {}: {:#}", self.session, items.len(), resource, e);
                skipped.extend(items);
            }
        }

        let mut names: BTreeSet<String> = fetch.parts.clone();
        names.extend(wanted.iter().cloned());
        let mut tx = if wanted.is_empty() {
            store.begin_read(&name)?
        } else {
            store.begin(&name)?
        };
        let mut accessed = Vec::new();
        let mut sent = 0;
        for id in ids.into_iter().filter(|id| !skipped.contains(id)) {
            // deleted while the resource was delivering
            let Some(item) = tx.item(id)? else {
                continue;
            };
            let item_parts = if fetch.all_attributes {
                tx.parts_of(id, None)?
                    .into_iter()
                    .filter(|p| names.contains(&p.name) || parts::is_attribute(&p.name))
                    .collect()
            } else if names.is_empty() {
                Vec::new()
            } else {
                tx.parts_of(id, Some(&names))?
            };
            let chain = match fetch.ancestors {
                Depth::Base => None,
                depth => {
                    let owner = tx.require_collection(item.collection_id)?;
                    let mut chain = tx.ancestors(&owner, parent_depth(depth))?;
                    chain.insert(0, owner);
                    Some(chain)
                }
            };
            self.send_item(&item, &item_parts, chain.as_deref());
            if !wanted.is_empty() {
                accessed.push(id);
            }
            sent += 1;
        }
        if !accessed.is_empty() {
            tx.touch_atime(&accessed)?;
        }
        tx.commit()?;
        Ok(format!("FETCH completed, {} items", sent))
    }

    fn append(&self, scope: &CollectionScope, new: NewItem, merge: bool) -> Result<String> {
        let mut tx = self.broker.store().begin(&self.session.name())?;
        let collection = self.collection(&tx, scope)?;
        if collection.is_virtual {
            return Err(BrokerError::constraint("Items cannot be appended to a virtual collection").into());
        }

        let mut item = Item::new(collection.id, new.mime_type);
        item.remote_id = new.remote_id;
        item.remote_revision = new.remote_revision;
        item.gid = new.gid;
        item.flags = new.flags;
        item.tags = new.tags;
        item.dirty = !self.session.speaks_for(&collection.resource);

        let created = if merge {
            tx.merge_item(&mut item, &new.parts)?
        } else {
            tx.append_item(&mut item, &new.parts)?;
            true
        };
        tx.commit()?;
        self.send_item(&item, &[], None);
        Ok(if created {
            format!("APPEND completed, item {}", item.id)
        } else {
            format!("APPEND merged into item {}", item.id)
        })
    }

    fn store(&self, scope: &ItemScope, revision: Option<i64>, changes: &ItemChanges) -> Result<String> {
        let mut tx = self.broker.store().begin(&self.session.name())?;
        let items = self.require_items(&tx, scope)?;
        if revision.is_some() && items.len() > 1 {
            return Err(BrokerError::syntax("REV applies to a single item").into());
        }
        let mut updated = Vec::with_capacity(items.len());
        for item in &items {
            updated.push(
                tx.update_item(item.id, revision, changes)
                    .with_context(|| format!("STORE of item {} failed", item.id))?,
            );
        }
        tx.commit()?;
        for item in &updated {
            self.send_item(item, &[], None);
        }
        Ok(format!("STORE completed, {} items", updated.len()))
    }

    fn move_items(&self, scope: &ItemScope, destination: &CollectionScope) -> Result<String> {
        let mut tx = self.broker.store().begin(&self.session.name())?;
        let items = self.require_items(&tx, scope)?;
        let destination = self.collection(&tx, destination)?;
        let ids: Vec<ItemId> = items.iter().map(|item| item.id).collect();
        let moved = tx.move_items(&ids, destination.id)?;
        tx.commit()?;
        Ok(format!("MOVE completed, {} items", moved.len()))
    }

    fn copy_items(&self, scope: &ItemScope, destination: &CollectionScope) -> Result<String> {
        let mut tx = self.broker.store().begin(&self.session.name())?;
        let items = self.require_items(&tx, scope)?;
        let destination = self.collection(&tx, destination)?;
        let copies = tx.copy_items(&items, destination.id)?;
        tx.commit()?;
        for copy in &copies {
            self.send_item(copy, &[], None);
        }
        Ok(format!("COPY completed, {} items", copies.len()))
    }

    fn remove_items(&self, scope: &ItemScope) -> Result<String> {
        let mut tx = self.broker.store().begin(&self.session.name())?;
        let items = self.require_items(&tx, scope)?;
        let ids: Vec<ItemId> = items.iter().map(|item| item.id).collect();
        let removed = tx.remove_items(&ids)?;
        tx.commit()?;
        Ok(format!("REMOVE completed, {} items", removed.len()))
    }

    fn create(&self, name: &str, parent: &CollectionScope, options: &CreateOptions) -> Result<String> {
        let mut tx = self.broker.store().begin(&self.session.name())?;
        let parent_id = self.parent(&tx, parent)?;

        let mut collection = Collection::new(name, parent_id);
        collection.resource = match (&options.resource, parent_id) {
            (Some(resource), _) => resource.clone(),
            (None, None) => self.selected_resource()?.to_string(),
            (None, Some(_)) => String::new(),
        };
        collection.remote_id = options.remote_id.clone();
        collection.remote_revision = options.remote_revision.clone();
        collection.mime_types = options.mime_types.clone();
        if let Some(policy) = &options.cache_policy {
            collection.cache_policy = policy.clone();
        }
        collection.is_virtual = options.is_virtual;
        if let Some(subscribed) = options.subscribed {
            collection.subscribed = subscribed;
        }
        collection.attributes = options.attributes.clone();

        tx.append_collection(&mut collection)?;
        tx.commit()?;
        self.send_collection(&collection, None, None);
        Ok(format!("CREATE completed, collection {}", collection.id))
    }

    fn modify(&self, scope: &CollectionScope, changes: &CollectionChanges) -> Result<String> {
        let mut tx = self.broker.store().begin(&self.session.name())?;
        let collection = self.collection(&tx, scope)?;
        let updated = tx.update_collection(collection.id, changes)?;
        tx.commit()?;
        self.send_collection(&updated, None, None);
        Ok("MODIFY completed".to_string())
    }

    fn delete(&self, scope: &CollectionScope) -> Result<String> {
        let mut tx = self.broker.store().begin(&self.session.name())?;
        let collection = self.collection(&tx, scope)?;
        let removed = tx.remove_collection(collection.id)?;
        tx.commit()?;
        Ok(format!("DELETE completed, {} collections", removed.len()))
    }

    fn rename(&self, scope: &CollectionScope, name: &str, parent: Option<&CollectionScope>) -> Result<String> {
        let mut tx = self.broker.store().begin(&self.session.name())?;
        let collection = self.collection(&tx, scope)?;
        let parent = match parent {
            Some(parent) => Some(self.collection(&tx, parent)?.id),
            None => None,
        };
        let renamed = tx.rename_collection(collection.id, name, parent)?;
        tx.commit()?;
        self.send_collection(&renamed, None, None);
        Ok("RENAME completed".to_string())
    }

    fn collection_move(&self, scope: &CollectionScope, parent: &CollectionScope) -> Result<String> {
        let mut tx = self.broker.store().begin(&self.session.name())?;
        let collection = self.collection(&tx, scope)?;
        let parent = self.collection(&tx, parent)?;
        let moved = tx.move_collection(collection.id, parent.id)?;
        tx.commit()?;
        self.send_collection(&moved, None, None);
        Ok("COLMOVE completed".to_string())
    }

    fn collection_copy(&self, scope: &CollectionScope, parent: &CollectionScope) -> Result<String> {
        let mut tx = self.broker.store().begin(&self.session.name())?;
        let collection = self.collection(&tx, scope)?;
        let parent = self.collection(&tx, parent)?;
        let copy = tx.copy_collection(collection.id, parent.id)?;
        tx.commit()?;
        self.send_collection(&copy, None, None);
        Ok(format!("COLCOPY completed, collection {}", copy.id))
    }

    fn subscribe(&self, scopes: &[CollectionScope], subscribe: bool) -> Result<String> {
        let mut tx = self.broker.store().begin(&self.session.name())?;
        let mut changed = 0;
        for scope in scopes {
            let collection = self.collection(&tx, scope)?;
            if tx.set_subscribed(collection.id, subscribe)? {
                changed += 1;
            }
        }
        tx.commit()?;
        Ok(format!("{} collections changed", changed))
    }

    fn link(&self, collection: &CollectionScope, scope: &ItemScope, link: bool) -> Result<String> {
        let mut tx = self.broker.store().begin(&self.session.name())?;
        let collection = self.collection(&tx, collection)?;
        let items = self.require_items(&tx, scope)?;
        let ids: Vec<ItemId> = items.iter().map(|item| item.id).collect();
        let changed = if link {
            tx.link_items(collection.id, &ids)?
        } else {
            tx.unlink_items(collection.id, &ids)?
        };
        tx.commit()?;
        Ok(format!(
            "{} completed, {} items",
            if link { "LINK" } else { "UNLINK" },
            changed.len()
        ))
    }

    fn tag_append(&self, changes: &TagChanges) -> Result<String> {
        let mut tx = self.broker.store().begin(&self.session.name())?;
        let (tag, created) = tx.append_tag(changes, self.session.selected_resource.as_deref())?;
        tx.commit()?;
        self.send(encode::tag(&tag));
        Ok(if created {
            format!("TAGAPPEND completed, tag {}", tag.id)
        } else {
            format!("TAGAPPEND merged into tag {}", tag.id)
        })
    }

    fn tag_fetch(&self, ids: Option<&UidSet>) -> Result<String> {
        let tx = self.broker.store().begin_read(&self.session.name())?;
        let ranges = ids.map(|set| set.ranges.clone()).unwrap_or_default();
        let tags = tx.tags(&ranges, self.session.selected_resource.as_deref())?;
        for tag in &tags {
            self.send(encode::tag(tag));
        }
        tx.rollback()?;
        Ok(format!("TAGFETCH completed, {} tags", tags.len()))
    }

    fn tag_store(&self, id: TagId, changes: &TagChanges) -> Result<String> {
        let mut tx = self.broker.store().begin(&self.session.name())?;
        let tag = tx.update_tag(id, changes, self.session.selected_resource.as_deref())?;
        tx.commit()?;
        self.send(encode::tag(&tag));
        Ok("TAGSTORE completed".to_string())
    }

    fn tag_remove(&self, id: TagId) -> Result<String> {
        let mut tx = self.broker.store().begin(&self.session.name())?;
        tx.remove_tag(id)?;
        tx.commit()?;
        Ok(format!("Tag {} removed", id))
    }

    fn relation_modify(&self, relation: &Relation) -> Result<String> {
        let mut tx = self.broker.store().begin(&self.session.name())?;
        let stored = tx.add_relation(relation)?;
        tx.commit()?;
        self.send(encode::relation(&stored));
        Ok("RELATIONMODIFY completed".to_string())
    }

    fn relation_remove(&self, left: ItemId, right: ItemId, relation_type: Option<&str>) -> Result<String> {
        let mut tx = self.broker.store().begin(&self.session.name())?;
        let removed = tx.remove_relations(left, right, relation_type)?;
        tx.commit()?;
        Ok(format!("RELATIONREMOVE completed, {} relations", removed.len()))
    }

    fn relation_fetch(&self, filter: RelationFilter) -> Result<String> {
        let tx = self.broker.store().begin_read(&self.session.name())?;
        let relations = tx.relations(&filter)?;
        for relation in &relations {
            self.send(encode::relation(relation));
        }
        tx.rollback()?;
        Ok(format!("RELATIONFETCH completed, {} relations", relations.len()))
    }

    fn search(&self, query: String, scope: SearchScope) -> Result<String> {
        let tx = self.broker.store().begin_read(&self.session.name())?;
        let items = self.broker.search().search(&tx, &search_spec(query, scope))?;
        tx.rollback()?;
        let mut values = vec![Value::atom("SEARCH")];
        values.push(Value::list(items.iter().map(|item| Value::int(item.id.0)).collect()));
        self.send(values);
        Ok(format!("SEARCH completed, {} matches", items.len()))
    }

    fn search_persistent(&self, name: &str, query: String, scope: SearchScope) -> Result<String> {
        let collection = self.broker.search().create_persistent(
            &self.session.name(),
            name,
            search_spec(query, scope),
        )?;
        self.send_collection(&collection, None, None);
        Ok(format!("SEARCHPERSISTENT completed, collection {}", collection.id))
    }

    fn monitor(&mut self, filter: Option<MonitorFilter>) -> Result<String> {
        let bus = Arc::clone(self.broker.store().bus());
        match (filter, self.session.monitor) {
            (Some(filter), Some(id)) => {
                bus.set_filter(id, filter)?;
                Ok("Monitor filter updated".to_string())
            }
            (Some(filter), None) => {
                let id = bus.subscribe(filter, Box::new(MonitorSink(self.outbox.clone())))?;
                self.session.monitor = Some(id);
                Ok("Monitoring".to_string())
            }
            (None, Some(id)) => {
                bus.unsubscribe(id)?;
                self.session.monitor = None;
                Ok("Monitor off".to_string())
            }
            (None, None) => Ok("Monitor was not active".to_string()),
        }
    }

    fn recorder_next(&self, name: &str) -> Result<String> {
        match self.broker.store().replay_next(name)? {
            Some(notification) => {
                let mut values = vec![Value::atom("NOTIFY")];
                values.extend(encode::notification(&notification));
                self.send(values);
                Ok(format!("Change {} pending acknowledgement", notification.sequence))
            }
            None => Ok("No pending changes".to_string()),
        }
    }

    fn resource_sync(&self, resource: &str, target: &SyncTarget) -> Result<String> {
        let kind = match target {
            SyncTarget::All => TaskKind::SyncAll,
            SyncTarget::Tree => TaskKind::SyncTree,
            SyncTarget::Collection { scope, parts } => {
                let tx = self.broker.store().begin_read(&self.session.name())?;
                let collection = self.collection(&tx, scope)?;
                tx.rollback()?;
                if collection.resource != resource {
                    return Err(BrokerError::constraint(format!(
                        "Collection {} belongs to {}, not {}",
                        collection.id, collection.resource, resource
                    ))
                    .into());
                }
                TaskKind::SyncCollection {
                    collection: collection.id,
                    parts: parts.clone(),
                }
            }
        };
        let scheduled = self.broker.resources().synchronize(resource, kind)?;
        scheduled_text(resource, scheduled)
    }

    fn resource_register(&mut self, resource: String) -> Result<String> {
        if let Some(current) = &self.session.adapter_for {
            if *current != resource {
                return Err(BrokerError::constraint(format!(
                    "Connection already serves resource {}",
                    current
                ))
                .into());
            }
        }
        let adapter = Arc::new(ConnectionAdapter(self.outbox.clone()));
        self.broker
            .resources()
            .register_adapter(&resource, self.session.connection_id(), adapter)?;
        let text = format!("Registered as adapter for {}", resource);
        self.session.selected_resource = Some(resource.clone());
        self.session.adapter_for = Some(resource);
        Ok(text)
    }
}

fn search_spec(query: String, scope: SearchScope) -> SearchSpec {
    SearchSpec {
        query,
        collections: scope.collections,
        recursive: scope.recursive,
        mime_types: scope.mime_types,
    }
}

fn scheduled_text(resource: &str, scheduled: Scheduled) -> Result<String> {
    match scheduled {
        Scheduled::Queued(serial) => Ok(format!("Task {} queued for {}", serial, resource)),
        Scheduled::Merged(serial) => Ok(format!("Merged into task {} of {}", serial, resource)),
        Scheduled::Offline => {
            Err(BrokerError::unavailable(format!("Resource {} is offline", resource)).into())
        }
    }
}

/// Depth of an item's ancestor chain above its own collection
fn parent_depth(depth: Depth) -> Depth {
    match depth {
        Depth::Levels(n) if n > 1 => Depth::Levels(n - 1),
        Depth::Levels(_) | Depth::Base => Depth::Base,
        Depth::Infinite => Depth::Infinite,
    }
}

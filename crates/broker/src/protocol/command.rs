//! Typed commands
//!
//! Turns a decoded [`Frame`] into a [`Command`]. Anything that does not fit
//! the grammar becomes a `BrokerError::ProtocolSyntax`.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};

use super::parser::Frame;
use super::value::Value;
use crate::error::BrokerError;
use crate::models::{
    CachePolicy, CollectionChanges, CollectionId, ItemChanges, ItemId, Part, Relation, TagChanges,
    TagId, parts,
};
use crate::notify::{EntityKind, MonitorFilter};

/// Recursion depth for tree-shaped requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    /// Only the addressed node
    Base,
    /// Up to this many levels below it
    Levels(u32),
    Infinite,
}

impl Depth {
    pub fn parse(value: &Value) -> Result<Self> {
        if value.is_keyword("INF") {
            return Ok(Depth::Infinite);
        }
        match value.as_i64() {
            Some(0) => Ok(Depth::Base),
            Some(n) if n > 0 && n <= u32::MAX as i64 => Ok(Depth::Levels(n as u32)),
            _ => Err(syntax(format!("Invalid depth {:?}", value))),
        }
    }

    /// Whether nodes `level` steps below the base are included
    pub fn includes(&self, level: u32) -> bool {
        match self {
            Depth::Base => level == 0,
            Depth::Levels(n) => level <= *n,
            Depth::Infinite => true,
        }
    }
}

/// Item id set such as `1,4,7:9` or `5:*`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UidSet {
    /// Inclusive ranges; `None` upper bound means unbounded
    pub ranges: Vec<(i64, Option<i64>)>,
}

impl UidSet {
    pub fn single(id: i64) -> Self {
        Self {
            ranges: vec![(id, Some(id))],
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let mut ranges = Vec::new();
        for piece in s.split(',') {
            let range = match piece.split_once(':') {
                Some((lo, "*")) => (parse_id(lo)?, None),
                Some((lo, hi)) => {
                    let (lo, hi) = (parse_id(lo)?, parse_id(hi)?);
                    (lo.min(hi), Some(lo.max(hi)))
                }
                None => {
                    let id = parse_id(piece)?;
                    (id, Some(id))
                }
            };
            ranges.push(range);
        }
        Ok(Self { ranges })
    }

    pub fn contains(&self, id: i64) -> bool {
        self.ranges
            .iter()
            .any(|(lo, hi)| id >= *lo && hi.is_none_or(|hi| id <= hi))
    }

    /// Explicit ids when every range is bounded
    pub fn ids(&self) -> Option<Vec<i64>> {
        let mut ids = Vec::new();
        for (lo, hi) in &self.ranges {
            ids.extend(*lo..=(*hi)?);
        }
        Some(ids)
    }
}

fn parse_id(s: &str) -> Result<i64> {
    match s.parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(syntax(format!("Invalid id '{}'", s))),
    }
}

/// Addresses one collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionScope {
    Id(CollectionId),
    /// Remote id inside the selected resource
    RemoteId(String),
    /// Remote id chain, leaf first, ending below the resource root
    HierarchicalRemoteId(Vec<String>),
    /// Slash-separated collection names from a root
    Path(String),
}

impl CollectionScope {
    /// The top-level sentinel (`0`) used as parent of resource roots
    pub fn is_top(&self) -> bool {
        matches!(self, CollectionScope::Id(CollectionId(0)))
    }
}

/// Addresses a set of items
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemScope {
    Uids(UidSet),
    RemoteId {
        remote_id: String,
        collection: Option<CollectionScope>,
    },
    Collection {
        scope: CollectionScope,
        depth: Depth,
    },
}

/// What a FETCH returns for each item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchScope {
    pub parts: BTreeSet<String>,
    pub full_payload: bool,
    pub all_attributes: bool,
    /// Never ask the resource for missing payload
    pub cache_only: bool,
    pub ancestors: Depth,
    pub changed_since: Option<DateTime<Utc>>,
    /// Skip items whose payload cannot be retrieved instead of failing
    pub ignore_errors: bool,
}

impl Default for FetchScope {
    fn default() -> Self {
        Self {
            parts: BTreeSet::new(),
            full_payload: false,
            all_attributes: false,
            cache_only: false,
            ancestors: Depth::Base,
            changed_since: None,
            ignore_errors: false,
        }
    }
}

impl FetchScope {
    /// Payload part names that must be present locally
    pub fn requested_payload(&self) -> BTreeSet<String> {
        let mut wanted: BTreeSet<String> = self
            .parts
            .iter()
            .filter(|p| parts::is_payload(p))
            .cloned()
            .collect();
        if self.full_payload {
            wanted.insert(parts::FULL_PAYLOAD.to_string());
        }
        wanted
    }
}

/// LIST filters and extra output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOptions {
    pub resource: Option<String>,
    pub mime_types: BTreeSet<String>,
    pub ancestors: Depth,
    pub statistics: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            resource: None,
            mime_types: BTreeSet::new(),
            ancestors: Depth::Base,
            statistics: false,
        }
    }
}

/// Where a search looks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchScope {
    pub collections: Vec<CollectionId>,
    pub recursive: bool,
    pub mime_types: Vec<String>,
}

/// What RESOURCESYNC asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTarget {
    All,
    Tree,
    Collection {
        scope: CollectionScope,
        parts: BTreeSet<String>,
    },
}

/// A new item delivered by APPEND
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewItem {
    pub mime_type: String,
    pub remote_id: Option<String>,
    pub remote_revision: Option<String>,
    pub gid: Option<String>,
    pub flags: BTreeSet<String>,
    pub tags: BTreeSet<TagId>,
    pub parts: Vec<Part>,
}

/// Options of CREATE
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CreateOptions {
    pub resource: Option<String>,
    pub remote_id: Option<String>,
    pub remote_revision: Option<String>,
    pub mime_types: Vec<String>,
    pub cache_policy: Option<CachePolicy>,
    pub is_virtual: bool,
    pub subscribed: Option<bool>,
    pub attributes: BTreeMap<String, Vec<u8>>,
}

/// A parsed request
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Login {
        session: String,
    },
    Logout,
    Capability,
    SelectResource {
        resource: Option<String>,
    },
    List {
        scope: CollectionScope,
        depth: Depth,
        options: ListOptions,
    },
    Fetch {
        scope: ItemScope,
        fetch: FetchScope,
    },
    Append {
        collection: CollectionScope,
        item: NewItem,
        merge: bool,
    },
    Store {
        scope: ItemScope,
        revision: Option<i64>,
        changes: ItemChanges,
    },
    Move {
        scope: ItemScope,
        destination: CollectionScope,
    },
    Copy {
        scope: ItemScope,
        destination: CollectionScope,
    },
    Remove {
        scope: ItemScope,
    },
    Create {
        name: String,
        parent: CollectionScope,
        options: CreateOptions,
    },
    Modify {
        scope: CollectionScope,
        changes: CollectionChanges,
    },
    Delete {
        scope: CollectionScope,
    },
    Rename {
        scope: CollectionScope,
        name: String,
        parent: Option<CollectionScope>,
    },
    CollectionMove {
        scope: CollectionScope,
        parent: CollectionScope,
    },
    CollectionCopy {
        scope: CollectionScope,
        parent: CollectionScope,
    },
    Subscribe {
        scopes: Vec<CollectionScope>,
        subscribe: bool,
    },
    Link {
        collection: CollectionScope,
        scope: ItemScope,
        link: bool,
    },
    TagAppend {
        changes: TagChanges,
    },
    TagFetch {
        ids: Option<UidSet>,
    },
    TagStore {
        id: TagId,
        changes: TagChanges,
    },
    TagRemove {
        id: TagId,
    },
    RelationModify {
        relation: Relation,
    },
    RelationRemove {
        left: ItemId,
        right: ItemId,
        relation_type: Option<String>,
    },
    RelationFetch {
        left: Option<ItemId>,
        right: Option<ItemId>,
        side: Option<ItemId>,
        types: Vec<String>,
    },
    Search {
        query: String,
        scope: SearchScope,
    },
    SearchPersistent {
        name: String,
        query: String,
        scope: SearchScope,
    },
    /// `None` switches monitoring off
    Monitor {
        filter: Option<MonitorFilter>,
    },
    RecorderRegister {
        name: String,
        filter: MonitorFilter,
    },
    RecorderNext {
        name: String,
    },
    RecorderAck {
        name: String,
        sequence: u64,
    },
    RecorderRemove {
        name: String,
    },
    ResourceSync {
        resource: String,
        target: SyncTarget,
    },
    ResourceState {
        resource: String,
        online: bool,
    },
    ResourceRegister {
        resource: String,
    },
    TaskHeartbeat {
        serial: u64,
    },
    TaskDone {
        serial: u64,
        error: Option<String>,
    },
    ReplayChanges {
        resource: String,
    },
}

impl Command {
    /// Parse a frame into a command
    pub fn parse(frame: &Frame) -> Result<Self> {
        let mut args = Args::new(&frame.args);
        let command = match frame.name.as_str() {
            "LOGIN" => Command::Login {
                session: args.string("session id")?,
            },
            "LOGOUT" => Command::Logout,
            "CAPABILITY" => Command::Capability,
            "SELECT-RESOURCE" => {
                let resource = args.string("resource name")?;
                Command::SelectResource {
                    resource: (!resource.is_empty()).then_some(resource),
                }
            }
            "LIST" => Command::List {
                scope: args.collection_scope()?,
                depth: Depth::parse(args.next("depth")?)?,
                options: parse_list_options(args.optional_list()?)?,
            },
            "FETCH" => Command::Fetch {
                scope: args.item_scope()?,
                fetch: parse_fetch_scope(args.optional_list()?)?,
            },
            "APPEND" => {
                let collection = args.collection_scope()?;
                let mime_type = args.string("mime type")?;
                let (item, merge) = parse_new_item(mime_type, args.optional_list()?)?;
                Command::Append {
                    collection,
                    item,
                    merge,
                }
            }
            "STORE" => {
                let scope = args.item_scope()?;
                let revision = if args.peek_keyword("REV") {
                    args.next("REV")?;
                    Some(args.int("revision")?)
                } else {
                    None
                };
                let changes = parse_item_changes(args.list("changes")?)?;
                Command::Store {
                    scope,
                    revision,
                    changes,
                }
            }
            "MOVE" => Command::Move {
                scope: args.item_scope()?,
                destination: args.collection_scope()?,
            },
            "COPY" => Command::Copy {
                scope: args.item_scope()?,
                destination: args.collection_scope()?,
            },
            "REMOVE" => Command::Remove {
                scope: args.item_scope()?,
            },
            "CREATE" => Command::Create {
                name: args.string("collection name")?,
                parent: args.collection_scope()?,
                options: parse_create_options(args.optional_list()?)?,
            },
            "MODIFY" => Command::Modify {
                scope: args.collection_scope()?,
                changes: parse_collection_changes(args.list("changes")?)?,
            },
            "DELETE" => Command::Delete {
                scope: args.collection_scope()?,
            },
            "RENAME" => Command::Rename {
                scope: args.collection_scope()?,
                name: args.string("new name")?,
                parent: if args.is_empty() {
                    None
                } else {
                    Some(args.collection_scope()?)
                },
            },
            "COLMOVE" => Command::CollectionMove {
                scope: args.collection_scope()?,
                parent: args.collection_scope()?,
            },
            "COLCOPY" => Command::CollectionCopy {
                scope: args.collection_scope()?,
                parent: args.collection_scope()?,
            },
            "SUBSCRIBE" | "UNSUBSCRIBE" => {
                let mut scopes = vec![args.collection_scope()?];
                while !args.is_empty() {
                    scopes.push(args.collection_scope()?);
                }
                Command::Subscribe {
                    scopes,
                    subscribe: frame.name == "SUBSCRIBE",
                }
            }
            "LINK" | "UNLINK" => Command::Link {
                collection: args.collection_scope()?,
                scope: args.item_scope()?,
                link: frame.name == "LINK",
            },
            "TAGAPPEND" => Command::TagAppend {
                changes: parse_tag_changes(args.list("tag")?)?,
            },
            "TAGFETCH" => {
                let ids = args.string("tag ids")?;
                Command::TagFetch {
                    ids: if ids.eq_ignore_ascii_case("ALL") {
                        None
                    } else {
                        Some(UidSet::parse(&ids)?)
                    },
                }
            }
            "TAGSTORE" => Command::TagStore {
                id: TagId(args.int("tag id")?),
                changes: parse_tag_changes(args.list("changes")?)?,
            },
            "TAGREMOVE" => Command::TagRemove {
                id: TagId(args.int("tag id")?),
            },
            "RELATIONMODIFY" => parse_relation_modify(&mut args)?,
            "RELATIONREMOVE" => parse_relation_remove(&mut args)?,
            "RELATIONFETCH" => parse_relation_fetch(args.optional_list()?)?,
            "SEARCH" => Command::Search {
                query: args.string("query")?,
                scope: parse_search_scope(args.optional_list()?)?,
            },
            "SEARCHPERSISTENT" => Command::SearchPersistent {
                name: args.string("search name")?,
                query: args.string("query")?,
                scope: parse_search_scope(args.optional_list()?)?,
            },
            "MONITOR" => {
                if args.peek_keyword("OFF") {
                    args.next("OFF")?;
                    Command::Monitor { filter: None }
                } else {
                    Command::Monitor {
                        filter: Some(parse_filter(args.list("filter")?)?),
                    }
                }
            }
            "RECORDER-REGISTER" => Command::RecorderRegister {
                name: args.string("recorder name")?,
                filter: parse_filter(args.list("filter")?)?,
            },
            "RECORDER-NEXT" => Command::RecorderNext {
                name: args.string("recorder name")?,
            },
            "RECORDER-ACK" => Command::RecorderAck {
                name: args.string("recorder name")?,
                sequence: args.uint("sequence")?,
            },
            "RECORDER-REMOVE" => Command::RecorderRemove {
                name: args.string("recorder name")?,
            },
            "RESOURCESYNC" => {
                let resource = args.string("resource name")?;
                let target = if args.peek_keyword("TREE") {
                    args.next("TREE")?;
                    SyncTarget::Tree
                } else if args.peek_keyword("COLLECTION") {
                    args.next("COLLECTION")?;
                    let scope = args.collection_scope()?;
                    let parts = if args.peek_keyword("PARTS") {
                        args.next("PARTS")?;
                        string_set(args.list("parts")?)?
                    } else {
                        BTreeSet::new()
                    };
                    SyncTarget::Collection { scope, parts }
                } else {
                    SyncTarget::All
                };
                Command::ResourceSync { resource, target }
            }
            "RESOURCESTATE" => {
                let resource = args.string("resource name")?;
                let state = args.string("state")?;
                let online = match state.to_ascii_uppercase().as_str() {
                    "ONLINE" => true,
                    "OFFLINE" => false,
                    other => return Err(syntax(format!("Unknown resource state {}", other))),
                };
                Command::ResourceState { resource, online }
            }
            "RESOURCE-REGISTER" => Command::ResourceRegister {
                resource: args.string("resource name")?,
            },
            "TASKHEARTBEAT" => Command::TaskHeartbeat {
                serial: args.uint("task serial")?,
            },
            "TASKDONE" => {
                let serial = args.uint("task serial")?;
                let error = if args.peek_keyword("ERROR") {
                    args.next("ERROR")?;
                    Some(args.string("error text")?)
                } else {
                    None
                };
                Command::TaskDone { serial, error }
            }
            "REPLAYCHANGES" => Command::ReplayChanges {
                resource: args.string("resource name")?,
            },
            other => return Err(syntax(format!("Unknown command {}", other))),
        };
        args.finish()?;
        Ok(command)
    }

    /// Whether the command may run before LOGIN
    pub fn allowed_before_login(&self) -> bool {
        matches!(
            self,
            Command::Login { .. } | Command::Logout | Command::Capability
        )
    }
}

fn syntax(msg: impl Into<String>) -> anyhow::Error {
    BrokerError::syntax(msg).into()
}

/// Sequential reader over command arguments
struct Args<'a> {
    values: &'a [Value],
    pos: usize,
}

impl<'a> Args<'a> {
    fn new(values: &'a [Value]) -> Self {
        Self { values, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.values.len()
    }

    fn next(&mut self, what: &str) -> Result<&'a Value> {
        let value = self
            .values
            .get(self.pos)
            .ok_or_else(|| syntax(format!("Missing {}", what)))?;
        self.pos += 1;
        Ok(value)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        self.values.get(self.pos).is_some_and(|v| v.is_keyword(keyword))
    }

    fn string(&mut self, what: &str) -> Result<String> {
        let value = self.next(what)?;
        if value.is_nil() {
            return Ok(String::new());
        }
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| syntax(format!("Expected {} as string", what)))
    }

    fn int(&mut self, what: &str) -> Result<i64> {
        self.next(what)?
            .as_i64()
            .ok_or_else(|| syntax(format!("Expected {} as number", what)))
    }

    fn uint(&mut self, what: &str) -> Result<u64> {
        u64::try_from(self.int(what)?).map_err(|_| syntax(format!("Negative {}", what)))
    }

    fn list(&mut self, what: &str) -> Result<&'a [Value]> {
        self.next(what)?
            .as_list()
            .ok_or_else(|| syntax(format!("Expected {} as list", what)))
    }

    fn optional_list(&mut self) -> Result<&'a [Value]> {
        if self.is_empty() {
            Ok(&[])
        } else {
            self.list("options")
        }
    }

    fn collection_scope(&mut self) -> Result<CollectionScope> {
        let value = self.next("collection")?;
        if value.is_keyword("RID") {
            return Ok(CollectionScope::RemoteId(self.string("remote id")?));
        }
        if value.is_keyword("HRID") {
            let chain = self
                .list("remote id chain")?
                .iter()
                .map(|v| value_string(v, "remote id"))
                .collect::<Result<Vec<_>>>()?;
            if chain.is_empty() {
                return Err(syntax("Empty remote id chain"));
            }
            return Ok(CollectionScope::HierarchicalRemoteId(chain));
        }
        if value.is_keyword("PATH") {
            return Ok(CollectionScope::Path(self.string("path")?));
        }
        match value.as_i64() {
            Some(id) if id >= 0 => Ok(CollectionScope::Id(CollectionId(id))),
            _ => Err(syntax(format!("Invalid collection {:?}", value))),
        }
    }

    fn item_scope(&mut self) -> Result<ItemScope> {
        let value = self.next("item scope")?;
        if value.is_keyword("UID") {
            return Ok(ItemScope::Uids(UidSet::parse(&self.string("uid set")?)?));
        }
        if value.is_keyword("RID") {
            let remote_id = self.string("remote id")?;
            let collection = if self.peek_keyword("COLLECTION") {
                self.next("COLLECTION")?;
                Some(self.collection_scope()?)
            } else {
                None
            };
            return Ok(ItemScope::RemoteId {
                remote_id,
                collection,
            });
        }
        if value.is_keyword("COLLECTION") {
            let scope = self.collection_scope()?;
            let depth = if self.peek_keyword("DEPTH") {
                self.next("DEPTH")?;
                Depth::parse(self.next("depth")?)?
            } else {
                Depth::Base
            };
            return Ok(ItemScope::Collection { scope, depth });
        }
        Err(syntax(format!("Invalid item scope {:?}", value)))
    }

    fn finish(&self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(syntax(format!(
                "Unexpected trailing argument {:?}",
                self.values[self.pos]
            )))
        }
    }
}

fn value_string(value: &Value, what: &str) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| syntax(format!("Expected {} as string", what)))
}

fn value_bytes(value: &Value) -> Vec<u8> {
    value.as_bytes().map(<[u8]>::to_vec).unwrap_or_default()
}

fn value_int(value: &Value, what: &str) -> Result<i64> {
    value
        .as_i64()
        .ok_or_else(|| syntax(format!("Expected {} as number", what)))
}

fn value_bool(value: &Value, what: &str) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| syntax(format!("Expected {} as boolean", what)))
}

fn string_set(values: &[Value]) -> Result<BTreeSet<String>> {
    values.iter().map(|v| value_string(v, "list entry")).collect()
}

fn id_set<T: From<i64> + Ord>(values: &[Value], what: &str) -> Result<BTreeSet<T>> {
    values.iter().map(|v| value_int(v, what).map(T::from)).collect()
}

/// Walk `KEY value` pairs and bare flags of an option list
fn options<'a>(
    values: &'a [Value],
    mut visit: impl FnMut(&str, &mut Args<'a>) -> Result<()>,
) -> Result<()> {
    let mut args = Args::new(values);
    while !args.is_empty() {
        let key = args.next("option")?;
        let key = key
            .as_str()
            .ok_or_else(|| syntax(format!("Expected option name, found {:?}", key)))?
            .to_string();
        visit(&key, &mut args)?;
    }
    Ok(())
}

/// Parse `(INHERIT <bool> INTERVAL <n> CACHETIMEOUT <n> SYNCONDEMAND <bool> LOCALPARTS (...))`
pub fn parse_cache_policy(values: &[Value]) -> Result<CachePolicy> {
    let mut policy = CachePolicy::default();
    options(values, |key, args| {
        match key.to_ascii_uppercase().as_str() {
            "INHERIT" => policy.inherit = value_bool(args.next("INHERIT")?, "INHERIT")?,
            "INTERVAL" => policy.check_interval = cache_minutes(args.int("INTERVAL")?)?,
            "CACHETIMEOUT" => policy.cache_timeout = cache_minutes(args.int("CACHETIMEOUT")?)?,
            "SYNCONDEMAND" => {
                policy.sync_on_demand = value_bool(args.next("SYNCONDEMAND")?, "SYNCONDEMAND")?
            }
            "LOCALPARTS" => {
                policy.local_parts = string_set(args.list("LOCALPARTS")?)?.into_iter().collect()
            }
            other => return Err(syntax(format!("Unknown cache policy key {}", other))),
        }
        Ok(())
    })?;
    Ok(policy)
}

fn cache_minutes(n: i64) -> Result<i32> {
    match i32::try_from(n) {
        Ok(n) if n >= -1 => Ok(n),
        _ => Err(syntax(format!("Invalid cache policy interval {}", n))),
    }
}

fn parse_list_options(values: &[Value]) -> Result<ListOptions> {
    let mut opts = ListOptions::default();
    options(values, |key, args| {
        match key.to_ascii_uppercase().as_str() {
            "RESOURCE" => opts.resource = Some(args.string("RESOURCE")?),
            "MIMETYPE" => opts.mime_types = string_set(args.list("MIMETYPE")?)?,
            "ANCESTORS" => opts.ancestors = Depth::parse(args.next("ANCESTORS")?)?,
            "STATISTICS" => opts.statistics = true,
            other => return Err(syntax(format!("Unknown LIST option {}", other))),
        }
        Ok(())
    })?;
    Ok(opts)
}

fn parse_fetch_scope(values: &[Value]) -> Result<FetchScope> {
    let mut scope = FetchScope::default();
    options(values, |key, args| {
        match key.to_ascii_uppercase().as_str() {
            "PARTS" => {
                let names = string_set(args.list("PARTS")?)?;
                if let Some(bad) = names.iter().find(|n| !parts::is_valid(n)) {
                    return Err(syntax(format!("Invalid part name {}", bad)));
                }
                scope.parts = names;
            }
            "FULLPAYLOAD" => scope.full_payload = true,
            "ALLATTR" => scope.all_attributes = true,
            "CACHEONLY" => scope.cache_only = true,
            "IGNOREERRORS" => scope.ignore_errors = true,
            "ANCESTORS" => scope.ancestors = Depth::parse(args.next("ANCESTORS")?)?,
            "CHANGEDSINCE" => {
                let ts = args.int("CHANGEDSINCE")?;
                scope.changed_since = Some(
                    Utc.timestamp_opt(ts, 0)
                        .single()
                        .ok_or_else(|| syntax(format!("Invalid timestamp {}", ts)))?,
                );
            }
            other => return Err(syntax(format!("Unknown FETCH option {}", other))),
        }
        Ok(())
    })?;
    Ok(scope)
}

/// Parse `(<part-name> <data> ...)` pairs
fn parse_parts(values: &[Value]) -> Result<Vec<Part>> {
    if values.len() % 2 != 0 {
        return Err(syntax("PARTS needs name/data pairs"));
    }
    values
        .chunks(2)
        .map(|pair| {
            let name = value_string(&pair[0], "part name")?;
            if !parts::is_valid(&name) {
                return Err(syntax(format!("Invalid part name {}", name)));
            }
            Ok(Part::new(name, value_bytes(&pair[1])))
        })
        .collect()
}

fn parse_new_item(mime_type: String, values: &[Value]) -> Result<(NewItem, bool)> {
    if mime_type.is_empty() {
        return Err(syntax("Missing mime type"));
    }
    let mut item = NewItem {
        mime_type,
        ..Default::default()
    };
    let mut merge = false;
    options(values, |key, args| {
        match key.to_ascii_uppercase().as_str() {
            "REMOTEID" => item.remote_id = Some(args.string("REMOTEID")?),
            "REMOTEREVISION" => item.remote_revision = Some(args.string("REMOTEREVISION")?),
            "GID" => item.gid = Some(args.string("GID")?),
            "FLAGS" => item.flags = string_set(args.list("FLAGS")?)?,
            "TAGS" => item.tags = id_set(args.list("TAGS")?, "tag id")?,
            "PARTS" => item.parts = parse_parts(args.list("PARTS")?)?,
            "MERGE" => merge = true,
            other => return Err(syntax(format!("Unknown APPEND option {}", other))),
        }
        Ok(())
    })?;
    if merge && item.remote_id.is_none() {
        return Err(syntax("MERGE requires a REMOTEID"));
    }
    Ok((item, merge))
}

fn parse_item_changes(values: &[Value]) -> Result<ItemChanges> {
    let mut changes = ItemChanges::default();
    options(values, |key, args| {
        match key.to_ascii_uppercase().as_str() {
            "+FLAGS" => changes.added_flags = string_set(args.list("+FLAGS")?)?,
            "-FLAGS" => changes.removed_flags = string_set(args.list("-FLAGS")?)?,
            "FLAGS" => changes.flags = Some(string_set(args.list("FLAGS")?)?),
            "+TAGS" => changes.added_tags = id_set(args.list("+TAGS")?, "tag id")?,
            "-TAGS" => changes.removed_tags = id_set(args.list("-TAGS")?, "tag id")?,
            "TAGS" => changes.tags = Some(id_set(args.list("TAGS")?, "tag id")?),
            "REMOTEID" => changes.remote_id = Some(args.string("REMOTEID")?),
            "REMOTEREVISION" => changes.remote_revision = Some(args.string("REMOTEREVISION")?),
            "GID" => changes.gid = Some(args.string("GID")?),
            "PARTS" => changes.parts = parse_parts(args.list("PARTS")?)?,
            "-PARTS" => changes.removed_parts = string_set(args.list("-PARTS")?)?,
            "DIRTY" => changes.dirty = Some(value_bool(args.next("DIRTY")?, "DIRTY")?),
            other => return Err(syntax(format!("Unknown STORE operation {}", other))),
        }
        Ok(())
    })?;
    if changes.is_empty() {
        return Err(syntax("STORE without changes"));
    }
    Ok(changes)
}

fn is_attribute_key(key: &str) -> bool {
    key.len() > 5 && key[..5].eq_ignore_ascii_case("ATTR:")
}

fn parse_create_options(values: &[Value]) -> Result<CreateOptions> {
    let mut opts = CreateOptions::default();
    options(values, |key, args| {
        match key.to_ascii_uppercase().as_str() {
            "RESOURCE" => opts.resource = Some(args.string("RESOURCE")?),
            "REMOTEID" => opts.remote_id = Some(args.string("REMOTEID")?),
            "REMOTEREVISION" => opts.remote_revision = Some(args.string("REMOTEREVISION")?),
            "MIMETYPE" => {
                opts.mime_types = string_set(args.list("MIMETYPE")?)?.into_iter().collect()
            }
            "CACHEPOLICY" => opts.cache_policy = Some(parse_cache_policy(args.list("CACHEPOLICY")?)?),
            "VIRTUAL" => opts.is_virtual = true,
            "SUBSCRIBED" => opts.subscribed = Some(value_bool(args.next("SUBSCRIBED")?, "SUBSCRIBED")?),
            _ if is_attribute_key(key) => {
                opts.attributes
                    .insert(key[5..].to_string(), value_bytes(args.next("attribute")?));
            }
            other => return Err(syntax(format!("Unknown CREATE option {}", other))),
        }
        Ok(())
    })?;
    Ok(opts)
}

fn parse_collection_changes(values: &[Value]) -> Result<CollectionChanges> {
    let mut changes = CollectionChanges::default();
    options(values, |key, args| {
        match key.to_ascii_uppercase().as_str() {
            "NAME" => changes.name = Some(args.string("NAME")?),
            "REMOTEID" => changes.remote_id = Some(args.string("REMOTEID")?),
            "REMOTEREVISION" => changes.remote_revision = Some(args.string("REMOTEREVISION")?),
            "MIMETYPE" => {
                changes.mime_types =
                    Some(string_set(args.list("MIMETYPE")?)?.into_iter().collect())
            }
            "CACHEPOLICY" => {
                changes.cache_policy = Some(parse_cache_policy(args.list("CACHEPOLICY")?)?)
            }
            "PARENT" => {
                let parent = args.int("PARENT")?;
                if parent <= 0 {
                    return Err(syntax("MODIFY cannot move a collection to the top level"));
                }
                changes.parent = Some(CollectionId(parent));
            }
            _ if is_attribute_key(key) => {
                changes
                    .attributes
                    .insert(key[5..].to_string(), value_bytes(args.next("attribute")?));
            }
            _ if key.starts_with('-') && is_attribute_key(&key[1..]) => {
                changes.removed_attributes.insert(key[6..].to_string());
            }
            other => return Err(syntax(format!("Unknown MODIFY option {}", other))),
        }
        Ok(())
    })?;
    if changes.is_empty() {
        return Err(syntax("MODIFY without changes"));
    }
    Ok(changes)
}

fn parse_tag_changes(values: &[Value]) -> Result<TagChanges> {
    let mut changes = TagChanges::default();
    options(values, |key, args| {
        match key.to_ascii_uppercase().as_str() {
            "GID" => changes.gid = Some(args.string("GID")?),
            "PARENT" => {
                let parent = args.int("PARENT")?;
                changes.parent_id = Some((parent > 0).then_some(TagId(parent)));
            }
            "TYPE" => changes.tag_type = Some(args.string("TYPE")?),
            "REMOTEID" => changes.remote_id = Some(args.string("REMOTEID")?),
            "NAME" => {
                changes
                    .attributes
                    .insert("NAME".to_string(), value_bytes(args.next("NAME")?));
            }
            _ if is_attribute_key(key) => {
                changes
                    .attributes
                    .insert(key[5..].to_string(), value_bytes(args.next("attribute")?));
            }
            _ if key.starts_with('-') && is_attribute_key(&key[1..]) => {
                changes.removed_attributes.insert(key[6..].to_string());
            }
            other => return Err(syntax(format!("Unknown tag option {}", other))),
        }
        Ok(())
    })?;
    Ok(changes)
}

fn parse_relation_modify(args: &mut Args<'_>) -> Result<Command> {
    let mut left = None;
    let mut right = None;
    let mut relation_type = Relation::GENERIC.to_string();
    let mut remote_id = None;
    while !args.is_empty() {
        let key = args.string("relation key")?;
        match key.to_ascii_uppercase().as_str() {
            "LEFT" => left = Some(ItemId(args.int("LEFT")?)),
            "RIGHT" => right = Some(ItemId(args.int("RIGHT")?)),
            "TYPE" => relation_type = args.string("TYPE")?,
            "REMOTEID" => remote_id = Some(args.string("REMOTEID")?),
            other => return Err(syntax(format!("Unknown relation key {}", other))),
        }
    }
    let (Some(left), Some(right)) = (left, right) else {
        return Err(syntax("Relation needs LEFT and RIGHT"));
    };
    let mut relation = Relation::new(left, right, relation_type);
    relation.remote_id = remote_id;
    Ok(Command::RelationModify { relation })
}

fn parse_relation_remove(args: &mut Args<'_>) -> Result<Command> {
    let mut left = None;
    let mut right = None;
    let mut relation_type = None;
    while !args.is_empty() {
        let key = args.string("relation key")?;
        match key.to_ascii_uppercase().as_str() {
            "LEFT" => left = Some(ItemId(args.int("LEFT")?)),
            "RIGHT" => right = Some(ItemId(args.int("RIGHT")?)),
            "TYPE" => relation_type = Some(args.string("TYPE")?),
            other => return Err(syntax(format!("Unknown relation key {}", other))),
        }
    }
    let (Some(left), Some(right)) = (left, right) else {
        return Err(syntax("Relation needs LEFT and RIGHT"));
    };
    Ok(Command::RelationRemove {
        left,
        right,
        relation_type,
    })
}

fn parse_relation_fetch(values: &[Value]) -> Result<Command> {
    let mut left = None;
    let mut right = None;
    let mut side = None;
    let mut types = Vec::new();
    options(values, |key, args| {
        match key.to_ascii_uppercase().as_str() {
            "LEFT" => left = Some(ItemId(args.int("LEFT")?)),
            "RIGHT" => right = Some(ItemId(args.int("RIGHT")?)),
            "SIDE" => side = Some(ItemId(args.int("SIDE")?)),
            "TYPE" => types = string_set(args.list("TYPE")?)?.into_iter().collect(),
            other => return Err(syntax(format!("Unknown RELATIONFETCH option {}", other))),
        }
        Ok(())
    })?;
    Ok(Command::RelationFetch {
        left,
        right,
        side,
        types,
    })
}

fn parse_search_scope(values: &[Value]) -> Result<SearchScope> {
    let mut scope = SearchScope::default();
    options(values, |key, args| {
        match key.to_ascii_uppercase().as_str() {
            "COLLECTIONS" => {
                scope.collections = id_set(args.list("COLLECTIONS")?, "collection id")?
                    .into_iter()
                    .collect()
            }
            "RECURSIVE" => scope.recursive = true,
            "MIMETYPE" => {
                scope.mime_types = string_set(args.list("MIMETYPE")?)?.into_iter().collect()
            }
            other => return Err(syntax(format!("Unknown search option {}", other))),
        }
        Ok(())
    })?;
    Ok(scope)
}

/// Parse a monitor/recorder filter list
pub fn parse_filter(values: &[Value]) -> Result<MonitorFilter> {
    let mut filter = MonitorFilter::default();
    options(values, |key, args| {
        match key.to_ascii_uppercase().as_str() {
            "ALL" => filter.all = true,
            "RESOURCES" => filter.resources = string_set(args.list("RESOURCES")?)?,
            "COLLECTIONS" => filter.collections = id_set(args.list("COLLECTIONS")?, "collection id")?,
            "ITEMS" => filter.items = id_set(args.list("ITEMS")?, "item id")?,
            "MIMETYPES" => filter.mime_types = string_set(args.list("MIMETYPES")?)?,
            "TAGS" => filter.tags = id_set(args.list("TAGS")?, "tag id")?,
            "TYPES" => {
                for kind in args.list("TYPES")? {
                    let name = value_string(kind, "entity kind")?;
                    let kind = EntityKind::parse(&name)
                        .ok_or_else(|| syntax(format!("Unknown entity kind {}", name)))?;
                    filter.types.insert(kind);
                }
            }
            "IGNORESESSIONS" => filter.ignored_sessions = string_set(args.list("IGNORESESSIONS")?)?,
            other => return Err(syntax(format!("Unknown filter option {}", other))),
        }
        Ok(())
    })?;
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, BrokerError};
    use crate::protocol::{DecodeResult, decode_frame};
    use bytes::BytesMut;

    fn parse(line: &str) -> Result<Command> {
        let mut buffer = BytesMut::from(line.as_bytes());
        match decode_frame(&mut buffer) {
            DecodeResult::Complete(frame) => Command::parse(&frame),
            other => panic!("frame did not decode: {:?}", other),
        }
    }

    fn is_syntax(result: Result<Command>) -> bool {
        match result {
            Err(e) => ErrorKind::classify(&e) == ErrorKind::Syntax,
            Ok(_) => false,
        }
    }

    #[test]
    fn test_uid_set() {
        let set = UidSet::parse("1,4,7:9").unwrap();
        assert_eq!(set.ids().unwrap(), vec![1, 4, 7, 8, 9]);
        let open = UidSet::parse("5:*").unwrap();
        assert!(open.contains(1000));
        assert!(!open.contains(4));
        assert!(open.ids().is_none());
        assert!(UidSet::parse("0").is_err());
        assert!(UidSet::parse("a:b").is_err());
    }

    #[test]
    fn test_depth() {
        assert_eq!(Depth::parse(&Value::atom("INF")).unwrap(), Depth::Infinite);
        assert_eq!(Depth::parse(&Value::atom("0")).unwrap(), Depth::Base);
        assert!(Depth::Levels(2).includes(2));
        assert!(!Depth::Levels(2).includes(3));
        assert!(Depth::parse(&Value::atom("-1")).is_err());
    }

    #[test]
    fn test_create_with_cache_policy() {
        let cmd = parse(
            "1 CREATE \"Inbox\" 0 (RESOURCE imap MIMETYPE (message/rfc822) CACHEPOLICY (INHERIT false INTERVAL 5 CACHETIMEOUT 30 SYNCONDEMAND true LOCALPARTS (PLD:HEAD)) ATTR:color \"red\")\r\n",
        )
        .unwrap();
        let Command::Create {
            name,
            parent,
            options,
        } = cmd
        else {
            panic!("not a CREATE");
        };
        assert_eq!(name, "Inbox");
        assert!(parent.is_top());
        assert_eq!(options.resource.as_deref(), Some("imap"));
        let policy = options.cache_policy.unwrap();
        assert!(!policy.inherit);
        assert_eq!(policy.check_interval, 5);
        assert_eq!(policy.cache_timeout, 30);
        assert!(policy.sync_on_demand);
        assert_eq!(policy.local_parts, vec!["PLD:HEAD"]);
        assert_eq!(options.attributes.get("color").unwrap(), b"red");
    }

    #[test]
    fn test_store_with_revision() {
        let cmd = parse("2 STORE UID 7 REV 3 (+FLAGS (\\SEEN) -TAGS (4) PARTS (PLD:RFC822 \"body\"))\r\n").unwrap();
        let Command::Store {
            scope,
            revision,
            changes,
        } = cmd
        else {
            panic!("not a STORE");
        };
        assert_eq!(scope, ItemScope::Uids(UidSet::single(7)));
        assert_eq!(revision, Some(3));
        assert!(changes.added_flags.contains("\\SEEN"));
        assert!(changes.removed_tags.contains(&TagId(4)));
        assert_eq!(changes.parts[0].data.as_deref(), Some(&b"body"[..]));
    }

    #[test]
    fn test_item_scopes() {
        let cmd = parse("3 FETCH RID \"msg-1\" COLLECTION RID \"INBOX\" (FULLPAYLOAD)\r\n").unwrap();
        assert_eq!(
            cmd,
            Command::Fetch {
                scope: ItemScope::RemoteId {
                    remote_id: "msg-1".into(),
                    collection: Some(CollectionScope::RemoteId("INBOX".into())),
                },
                fetch: FetchScope {
                    full_payload: true,
                    ..Default::default()
                },
            }
        );

        let cmd = parse("4 FETCH COLLECTION HRID (\"sub\" \"INBOX\") DEPTH INF\r\n").unwrap();
        assert_eq!(
            cmd,
            Command::Fetch {
                scope: ItemScope::Collection {
                    scope: CollectionScope::HierarchicalRemoteId(vec!["sub".into(), "INBOX".into()]),
                    depth: Depth::Infinite,
                },
                fetch: FetchScope::default(),
            }
        );
    }

    #[test]
    fn test_monitor_filter() {
        let cmd = parse("5 MONITOR (RESOURCES (imap) TYPES (ITEMS COLLECTIONS) IGNORESESSIONS (imap))\r\n").unwrap();
        let Command::Monitor { filter: Some(filter) } = cmd else {
            panic!("not a MONITOR");
        };
        assert!(filter.resources.contains("imap"));
        assert!(filter.types.contains(&EntityKind::Collections));
        assert!(filter.ignored_sessions.contains("imap"));

        assert_eq!(parse("6 MONITOR OFF\r\n").unwrap(), Command::Monitor { filter: None });
    }

    #[test]
    fn test_resource_sync_targets() {
        assert_eq!(
            parse("7 RESOURCESYNC imap\r\n").unwrap(),
            Command::ResourceSync {
                resource: "imap".into(),
                target: SyncTarget::All
            }
        );
        assert_eq!(
            parse("8 RESOURCESYNC imap COLLECTION 4 PARTS (PLD:HEAD)\r\n").unwrap(),
            Command::ResourceSync {
                resource: "imap".into(),
                target: SyncTarget::Collection {
                    scope: CollectionScope::Id(CollectionId(4)),
                    parts: ["PLD:HEAD".to_string()].into(),
                }
            }
        );
    }

    #[test]
    fn test_select_resource_empty_deselects() {
        assert_eq!(
            parse("9 SELECT-RESOURCE \"\"\r\n").unwrap(),
            Command::SelectResource { resource: None }
        );
    }

    #[test]
    fn test_syntax_errors() {
        assert!(is_syntax(parse("1 FROBNICATE\r\n")));
        assert!(is_syntax(parse("1 LIST 4\r\n")));
        assert!(is_syntax(parse("1 STORE UID 4 ()\r\n")));
        assert!(is_syntax(parse("1 STORE UID 4 (BOGUS 1)\r\n")));
        assert!(is_syntax(parse("1 LOGOUT extra\r\n")));
        assert!(is_syntax(parse("1 FETCH UID 1 (PARTS (BODY))\r\n")));
        assert!(is_syntax(parse("1 APPEND 4 text/plain (MERGE)\r\n")));
    }

    #[test]
    fn test_task_done_with_error() {
        assert_eq!(
            parse("1 TASKDONE 12 ERROR \"server went away\"\r\n").unwrap(),
            Command::TaskDone {
                serial: 12,
                error: Some("server went away".into())
            }
        );
    }

    #[test]
    fn test_syntax_error_type() {
        let err = parse("1 NOPE\r\n").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BrokerError>(),
            Some(BrokerError::ProtocolSyntax(_))
        ));
    }
}

//! Entity and event encoding for data responses

use crate::models::{CachePolicy, Collection, CollectionStatistics, Item, Part, Relation, Tag};
use crate::notify::{
    Change, CollectionOperation, ItemOperation, Notification, RelationOperation, TagOperation,
};
use crate::scheduler::{TaskKind, TaskRequest};

use super::value::Value;

fn key(name: &str) -> Value {
    Value::atom(name)
}

fn strings<'a>(items: impl IntoIterator<Item = &'a String>) -> Value {
    Value::list(items.into_iter().map(|s| Value::string(s.as_str())).collect())
}

fn ids(items: impl IntoIterator<Item = i64>) -> Value {
    Value::list(items.into_iter().map(Value::int).collect())
}

/// `(INHERIT <bool> INTERVAL <n> CACHETIMEOUT <n> SYNCONDEMAND <bool> LOCALPARTS (...))`
pub fn cache_policy(policy: &CachePolicy) -> Value {
    Value::list(vec![
        key("INHERIT"),
        Value::bool(policy.inherit),
        key("INTERVAL"),
        Value::int(policy.check_interval as i64),
        key("CACHETIMEOUT"),
        Value::int(policy.cache_timeout as i64),
        key("SYNCONDEMAND"),
        Value::bool(policy.sync_on_demand),
        key("LOCALPARTS"),
        Value::list(policy.local_parts.iter().map(|p| Value::atom(p.as_str())).collect()),
    ])
}

/// Ancestor chain `((id "name") ...)`, nearest parent first
pub fn ancestors(chain: &[Collection]) -> Value {
    Value::list(
        chain
            .iter()
            .map(|c| Value::list(vec![Value::int(c.id.0), Value::string(c.name.as_str())]))
            .collect(),
    )
}

/// `<id> <parent> (<attributes>)`
pub fn collection(
    collection: &Collection,
    chain: Option<&[Collection]>,
    statistics: Option<CollectionStatistics>,
) -> Vec<Value> {
    let mut attrs = vec![
        key("NAME"),
        Value::string(collection.name.as_str()),
        key("RESOURCE"),
        Value::string(collection.resource.as_str()),
        key("REMOTEID"),
        Value::opt_string(collection.remote_id.as_deref()),
        key("REMOTEREVISION"),
        Value::opt_string(collection.remote_revision.as_deref()),
        key("MIMETYPE"),
        strings(&collection.mime_types),
        key("CACHEPOLICY"),
        cache_policy(&collection.cache_policy),
        key("SUBSCRIBED"),
        Value::bool(collection.subscribed),
        key("VIRTUAL"),
        Value::bool(collection.is_virtual),
        key("REV"),
        Value::int(collection.revision),
    ];
    if let Some(search) = &collection.search {
        attrs.push(key("PERSISTENTSEARCH"));
        attrs.push(Value::list(vec![
            key("QUERYSTRING"),
            Value::string(search.query.as_str()),
            key("QUERYCOLLECTIONS"),
            ids(search.collections.iter().map(|c| c.0)),
            key("RECURSIVE"),
            Value::bool(search.recursive),
            key("MIMETYPE"),
            strings(&search.mime_types),
        ]));
    }
    if let Some(chain) = chain {
        attrs.push(key("ANCESTORS"));
        attrs.push(ancestors(chain));
    }
    if let Some(stats) = statistics {
        attrs.push(key("STATISTICS"));
        attrs.push(Value::list(vec![
            key("COUNT"),
            Value::int(stats.count),
            key("SIZE"),
            Value::int(stats.size),
            key("UNSEEN"),
            Value::int(stats.unseen),
        ]));
    }
    for (name, value) in &collection.attributes {
        attrs.push(Value::atom(format!("ATTR:{}", name)));
        attrs.push(Value::string(value.clone()));
    }

    vec![
        Value::int(collection.id.0),
        Value::int(collection.parent_id.map_or(0, |p| p.0)),
        Value::list(attrs),
    ]
}

/// `<id> (REV <n> ... PARTS (<name> <data> ...))`
pub fn item(item: &Item, parts: &[Part], chain: Option<&[Collection]>) -> Vec<Value> {
    let mut attrs = vec![
        key("REV"),
        Value::int(item.revision),
        key("COLLECTIONID"),
        Value::int(item.collection_id.0),
        key("MIMETYPE"),
        Value::string(item.mime_type.as_str()),
        key("REMOTEID"),
        Value::opt_string(item.remote_id.as_deref()),
        key("REMOTEREVISION"),
        Value::opt_string(item.remote_revision.as_deref()),
        key("GID"),
        Value::opt_string(item.gid.as_deref()),
        key("SIZE"),
        Value::int(item.size),
        key("MTIME"),
        Value::int(item.mtime.timestamp()),
        key("FLAGS"),
        Value::list(item.flags.iter().map(|f| Value::atom(f.as_str())).collect()),
        key("TAGS"),
        ids(item.tags.iter().map(|t| t.0)),
    ];
    if let Some(chain) = chain {
        attrs.push(key("ANCESTORS"));
        attrs.push(ancestors(chain));
    }
    let mut payload = Vec::with_capacity(parts.len() * 2);
    for part in parts {
        payload.push(Value::atom(part.name.as_str()));
        payload.push(match &part.data {
            Some(data) => Value::string(data.clone()),
            None => Value::Nil,
        });
    }
    attrs.push(key("PARTS"));
    attrs.push(Value::list(payload));

    vec![Value::int(item.id.0), Value::list(attrs)]
}

/// `<id> (GID "..." PARENT <id> TYPE "..." REMOTEID ... ATTR:<k> <v> ...)`
pub fn tag(tag: &Tag) -> Vec<Value> {
    let mut attrs = vec![
        key("GID"),
        Value::string(tag.gid.as_str()),
        key("PARENT"),
        Value::int(tag.parent_id.map_or(0, |p| p.0)),
        key("TYPE"),
        Value::string(tag.tag_type.as_str()),
        key("REMOTEID"),
        Value::opt_string(tag.remote_id.as_deref()),
    ];
    for (name, value) in &tag.attributes {
        attrs.push(Value::atom(format!("ATTR:{}", name)));
        attrs.push(Value::string(value.clone()));
    }
    vec![Value::atom("TAG"), Value::int(tag.id.0), Value::list(attrs)]
}

pub fn relation(relation: &Relation) -> Vec<Value> {
    vec![
        Value::atom("RELATION"),
        Value::list(relation_fields(relation)),
    ]
}

fn relation_fields(relation: &Relation) -> Vec<Value> {
    vec![
        key("LEFT"),
        Value::int(relation.left.0),
        key("RIGHT"),
        Value::int(relation.right.0),
        key("TYPE"),
        Value::string(relation.relation_type.as_str()),
        key("REMOTEID"),
        Value::opt_string(relation.remote_id.as_deref()),
    ]
}

fn item_operation(op: ItemOperation) -> &'static str {
    match op {
        ItemOperation::Add => "ADD",
        ItemOperation::Modify => "MODIFY",
        ItemOperation::ModifyFlags => "MODIFYFLAGS",
        ItemOperation::ModifyTags => "MODIFYTAGS",
        ItemOperation::ModifyRelations => "MODIFYRELATIONS",
        ItemOperation::Move => "MOVE",
        ItemOperation::Remove => "REMOVE",
        ItemOperation::Link => "LINK",
        ItemOperation::Unlink => "UNLINK",
    }
}

fn collection_operation(op: CollectionOperation) -> &'static str {
    match op {
        CollectionOperation::Add => "ADD",
        CollectionOperation::Modify => "MODIFY",
        CollectionOperation::Move => "MOVE",
        CollectionOperation::Remove => "REMOVE",
        CollectionOperation::Subscribe => "SUBSCRIBE",
        CollectionOperation::Unsubscribe => "UNSUBSCRIBE",
    }
}

/// `<seq> <KIND> <OP> (<fields>)`
pub fn notification(notification: &Notification) -> Vec<Value> {
    let mut fields = vec![key("SESSION"), Value::string(notification.session.as_str())];
    let (kind, op) = match &notification.change {
        Change::Item(change) => {
            fields.extend([
                key("RESOURCE"),
                Value::string(change.resource.as_str()),
                key("COLLECTION"),
                Value::int(change.collection.0),
            ]);
            if let Some(dest) = &change.destination_resource {
                fields.extend([key("DESTRESOURCE"), Value::string(dest.as_str())]);
            }
            if let Some(dest) = change.destination_collection {
                fields.extend([key("DESTCOLLECTION"), Value::int(dest.0)]);
            }
            fields.push(key("ITEMS"));
            fields.push(Value::list(
                change
                    .items
                    .iter()
                    .map(|i| {
                        Value::list(vec![
                            Value::int(i.id.0),
                            Value::opt_string(i.remote_id.as_deref()),
                            Value::string(i.mime_type.as_str()),
                        ])
                    })
                    .collect(),
            ));
            if !change.parts.is_empty() {
                fields.extend([key("PARTS"), strings(&change.parts)]);
            }
            if !change.added_flags.is_empty() {
                fields.extend([key("ADDEDFLAGS"), strings(&change.added_flags)]);
            }
            if !change.removed_flags.is_empty() {
                fields.extend([key("REMOVEDFLAGS"), strings(&change.removed_flags)]);
            }
            if !change.added_tags.is_empty() {
                fields.extend([key("ADDEDTAGS"), ids(change.added_tags.iter().map(|t| t.0))]);
            }
            if !change.removed_tags.is_empty() {
                fields.extend([
                    key("REMOVEDTAGS"),
                    ids(change.removed_tags.iter().map(|t| t.0)),
                ]);
            }
            for (name, relations) in [
                ("ADDEDRELATIONS", &change.added_relations),
                ("REMOVEDRELATIONS", &change.removed_relations),
            ] {
                if !relations.is_empty() {
                    fields.push(key(name));
                    fields.push(Value::list(
                        relations
                            .iter()
                            .map(|r| Value::list(relation_fields(r)))
                            .collect(),
                    ));
                }
            }
            ("ITEM", item_operation(change.operation))
        }
        Change::Collection(change) => {
            fields.extend([
                key("ID"),
                Value::int(change.id.0),
                key("RESOURCE"),
                Value::string(change.resource.as_str()),
                key("REMOTEID"),
                Value::opt_string(change.remote_id.as_deref()),
                key("PARENT"),
                Value::int(change.parent.map_or(0, |p| p.0)),
            ]);
            if let Some(dest) = &change.destination_resource {
                fields.extend([key("DESTRESOURCE"), Value::string(dest.as_str())]);
            }
            if let Some(dest) = change.destination_parent {
                fields.extend([key("DESTPARENT"), Value::int(dest.0)]);
            }
            if !change.changed.is_empty() {
                fields.extend([key("CHANGED"), strings(&change.changed)]);
            }
            ("COLLECTION", collection_operation(change.operation))
        }
        Change::Tag(change) => {
            fields.extend([
                key("ID"),
                Value::int(change.id.0),
                key("GID"),
                Value::string(change.gid.as_str()),
            ]);
            if let Some(resource) = &change.resource {
                fields.extend([
                    key("RESOURCE"),
                    Value::string(resource.as_str()),
                    key("REMOTEID"),
                    Value::opt_string(change.remote_id.as_deref()),
                ]);
            }
            let op = match change.operation {
                TagOperation::Add => "ADD",
                TagOperation::Modify => "MODIFY",
                TagOperation::Remove => "REMOVE",
            };
            ("TAG", op)
        }
        Change::Relation(change) => {
            fields.extend(relation_fields(&change.relation));
            let op = match change.operation {
                RelationOperation::Add => "ADD",
                RelationOperation::Remove => "REMOVE",
            };
            ("RELATION", op)
        }
    };

    vec![
        Value::int(notification.sequence as i64),
        Value::atom(kind),
        Value::atom(op),
        Value::list(fields),
    ]
}

/// `TASK <serial> <KIND> [...]` as handed to an adapter connection
pub fn task(task: &TaskRequest) -> Vec<Value> {
    let mut values = vec![key("TASK"), Value::int(task.serial as i64)];
    match &task.kind {
        TaskKind::SyncAll => values.push(key("SYNC")),
        TaskKind::SyncTree => values.push(key("SYNCTREE")),
        TaskKind::SyncCollection { collection, parts } => values.extend([
            key("SYNCCOLLECTION"),
            Value::int(collection.0),
            key("PARTS"),
            Value::list(parts.iter().map(|p| Value::atom(p.as_str())).collect()),
        ]),
        TaskKind::FetchItems { items, parts } => values.extend([
            key("FETCH"),
            ids(items.iter().map(|i| i.0)),
            key("PARTS"),
            Value::list(parts.iter().map(|p| Value::atom(p.as_str())).collect()),
        ]),
        TaskKind::ChangeReplay => values.push(key("REPLAY")),
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CollectionId, ItemId};
    use crate::notify::{ItemChange, NotifiedItem};
    use crate::protocol::Response;

    #[test]
    fn test_collection_line() {
        let mut col = Collection::new("Inbox", Some(CollectionId(1)));
        col.id = CollectionId(4);
        col.resource = "imap".into();
        col.mime_types = vec!["message/rfc822".into()];
        let mut values = vec![Value::atom("COLLECTION")];
        values.extend(collection(&col, None, None));
        let line = Response::data(values).to_bytes();
        let text = String::from_utf8(line.to_vec()).unwrap();
        assert!(text.starts_with("* COLLECTION 4 1 (NAME \"Inbox\" RESOURCE \"imap\""));
        assert!(text.contains(
            "CACHEPOLICY (INHERIT TRUE INTERVAL -1 CACHETIMEOUT -1 SYNCONDEMAND FALSE LOCALPARTS (ALL))"
        ));
    }

    #[test]
    fn test_fetch_task_line() {
        let request = TaskRequest {
            serial: 3,
            resource: "imap".into(),
            kind: TaskKind::FetchItems {
                items: [ItemId(5), ItemId(8)].into(),
                parts: ["PLD:RFC822".to_string()].into(),
            },
        };
        let text = String::from_utf8(Response::data(task(&request)).to_bytes().to_vec()).unwrap();
        assert_eq!(text, "* TASK 3 FETCH (5 8) PARTS (PLD:RFC822)\r\n");
    }

    #[test]
    fn test_notification_line() {
        let mut change = ItemChange::new(
            ItemOperation::ModifyFlags,
            vec![NotifiedItem {
                id: ItemId(9),
                remote_id: Some("r9".into()),
                remote_revision: None,
                mime_type: "text/plain".into(),
            }],
            "imap",
            CollectionId(4),
        );
        change.added_flags.insert("\\SEEN".into());
        let mut n = Notification::new("client", Change::Item(change));
        n.sequence = 12;
        let mut values = vec![Value::atom("NOTIFY")];
        values.extend(notification(&n));
        let text = String::from_utf8(Response::data(values).to_bytes().to_vec()).unwrap();
        assert_eq!(
            text,
            "* NOTIFY 12 ITEM MODIFYFLAGS (SESSION \"client\" RESOURCE \"imap\" COLLECTION 4 ITEMS ((9 \"r9\" \"text/plain\")) ADDEDFLAGS (\"\\\\SEEN\"))\r\n"
        );
    }
}

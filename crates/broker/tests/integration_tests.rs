//! Integration tests for the broker crate
//!
//! These exercise storage, notification, scheduling and search through the
//! public API, plus a full client session over TCP.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use broker::config::{SchedulerConfig, SearchConfig, StorageConfig};
use broker::models::{CachePolicy, Collection, Item, ItemChanges, ItemId, Part, flags};
use broker::notify::{EntityKind, ItemOperation, MonitorFilter};
use broker::scheduler::{Scheduled, TaskKind};
use broker::search::{SearchManager, SearchProvider, SearchRequest};
use broker::protocol::{DecodeResult, decode_frame};
use broker::storage::ItemFilter;
use broker::{
    Broker, BrokerConfig, BrokerError, ResourceEntry, ResourceManager, ResourceManifest, Server,
    Store,
};
use bytes::BytesMut;
use tempfile::{TempDir, tempdir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

/// Store with one resource root collection
fn open_store() -> Result<(TempDir, Arc<Store>, Collection)> {
    let dir = tempdir()?;
    let config = StorageConfig {
        external_threshold: 16,
        ..StorageConfig::default()
    };
    let store = Arc::new(Store::open(dir.path(), &config)?);
    let mut tx = store.begin("test")?;
    let mut root = Collection::new("IMAP", None);
    root.resource = "imap".into();
    tx.append_collection(&mut root)?;
    tx.commit()?;
    Ok((dir, store, root))
}

fn online_manifest(name: &str) -> ResourceManifest {
    ResourceManifest {
        resources: vec![ResourceEntry {
            name: name.into(),
            mime_types: vec!["message/rfc822".into()],
            online: true,
        }],
    }
}

#[test]
fn test_created_collection_keeps_name_and_policy() -> Result<()> {
    let (_dir, store, root) = open_store()?;
    let policy = CachePolicy {
        inherit: false,
        check_interval: 15,
        cache_timeout: 60,
        sync_on_demand: true,
        local_parts: vec!["PLD:HEAD".into()],
    };

    let mut tx = store.begin("client")?;
    let mut inbox = Collection::new("Inbox", Some(root.id));
    inbox.cache_policy = policy.clone();
    tx.append_collection(&mut inbox)?;
    tx.commit()?;

    let tx = store.begin_read("client")?;
    let fetched = tx.require_collection(inbox.id)?;
    assert_eq!(fetched.name, "Inbox");
    assert_eq!(fetched.cache_policy, policy);
    assert_eq!(fetched.resource, "imap");
    tx.rollback()?;
    Ok(())
}

#[test]
fn test_flag_round_trip() -> Result<()> {
    let (_dir, store, root) = open_store()?;
    let mut tx = store.begin("client")?;
    let mut item = Item::new(root.id, "message/rfc822");
    tx.append_item(&mut item, &[Part::new("PLD:RFC822", b"hi".to_vec())])?;
    tx.commit()?;

    for _ in 0..2 {
        let mut tx = store.begin("client")?;
        tx.update_item(item.id, None, &ItemChanges::default().add_flag(flags::FLAGGED))?;
        tx.commit()?;
        let tx = store.begin_read("client")?;
        assert!(tx.require_item(item.id)?.flags.contains(flags::FLAGGED));
        tx.rollback()?;
    }

    let mut tx = store.begin("client")?;
    let updated = tx.update_item(item.id, None, &ItemChanges::default().remove_flag(flags::FLAGGED))?;
    tx.commit()?;
    assert!(!updated.flags.contains(flags::FLAGGED));
    Ok(())
}

#[test]
fn test_stale_revision_conflicts() -> Result<()> {
    let (_dir, store, root) = open_store()?;
    let mut tx = store.begin("client")?;
    let mut item = Item::new(root.id, "message/rfc822");
    tx.append_item(&mut item, &[])?;
    tx.commit()?;
    let seen_revision = item.revision;

    let mut first = store.begin("first")?;
    first.update_item(item.id, Some(seen_revision), &ItemChanges::default().add_flag(flags::FLAGGED))?;
    first.commit()?;

    let mut second = store.begin("second")?;
    let err = second
        .update_item(item.id, Some(seen_revision), &ItemChanges::default().add_flag(flags::SEEN))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BrokerError>(),
        Some(BrokerError::TransactionConflict(_))
    ));
    second.rollback()?;

    let tx = store.begin_read("client")?;
    let stored = tx.require_item(item.id)?;
    assert_eq!(stored.flags, BTreeSet::from([flags::FLAGGED.to_string()]));
    assert_eq!(stored.revision, seen_revision + 1);
    tx.rollback()?;
    Ok(())
}

#[test]
fn test_rename_moves_subtree() -> Result<()> {
    let (_dir, store, root) = open_store()?;
    let mut tx = store.begin("client")?;
    let mut a = Collection::new("a", Some(root.id));
    tx.append_collection(&mut a)?;
    let mut c = Collection::new("c", Some(a.id));
    tx.append_collection(&mut c)?;
    tx.commit()?;

    let mut tx = store.begin("client")?;
    tx.rename_collection(a.id, "b", None)?;
    tx.commit()?;

    let tx = store.begin_read("client")?;
    let moved = tx.collection_by_path(Some("imap"), "IMAP/b/c")?;
    assert_eq!(moved.map(|col| col.id), Some(c.id));
    assert!(tx.collection_by_path(Some("imap"), "IMAP/a/c")?.is_none());
    tx.rollback()?;
    Ok(())
}

#[test]
fn test_rename_with_new_parent_checks_the_new_name() -> Result<()> {
    let (_dir, store, root) = open_store()?;
    let mut tx = store.begin("client")?;
    let mut a = Collection::new("a", Some(root.id));
    tx.append_collection(&mut a)?;
    let mut b = Collection::new("b", Some(root.id));
    tx.append_collection(&mut b)?;
    let mut ax = Collection::new("x", Some(a.id));
    tx.append_collection(&mut ax)?;
    let mut bx = Collection::new("x", Some(b.id));
    tx.append_collection(&mut bx)?;
    let mut az = Collection::new("z", Some(a.id));
    tx.append_collection(&mut az)?;
    tx.commit()?;

    let mut tx = store.begin("client")?;
    let renamed = tx.rename_collection(ax.id, "y", Some(b.id))?;
    assert_eq!(renamed.parent_id, Some(b.id));
    assert_eq!(renamed.name, "y");
    let clash = tx.rename_collection(renamed.id, "z", Some(a.id)).unwrap_err();
    assert_eq!(broker::ErrorKind::classify(&clash), broker::ErrorKind::Constraint);
    tx.commit()?;

    let tx = store.begin_read("client")?;
    assert_eq!(tx.collection_by_path(Some("imap"), "IMAP/b/y")?.map(|c| c.id), Some(ax.id));
    assert_eq!(tx.collection_by_path(Some("imap"), "IMAP/b/x")?.map(|c| c.id), Some(bx.id));
    assert!(tx.collection_by_path(Some("imap"), "IMAP/a/x")?.is_none());
    tx.rollback()?;
    Ok(())
}

#[test]
fn test_delete_leaves_no_orphaned_parts() -> Result<()> {
    let (_dir, store, root) = open_store()?;
    let mut tx = store.begin("client")?;
    let mut folder = Collection::new("Archive", Some(root.id));
    tx.append_collection(&mut folder)?;
    let mut nested = Collection::new("2024", Some(folder.id));
    tx.append_collection(&mut nested)?;
    for (collection, body) in [(folder.id, "small"), (nested.id, "a payload larger than the threshold")] {
        let mut item = Item::new(collection, "message/rfc822");
        tx.append_item(&mut item, &[Part::new("PLD:RFC822", body.as_bytes().to_vec())])?;
    }
    let files = tx.referenced_part_files()?;
    assert_eq!(files.len(), 1);
    tx.commit()?;

    let mut tx = store.begin("client")?;
    let removed = tx.remove_collection(folder.id)?;
    assert_eq!(removed.len(), 2);
    tx.commit()?;

    let tx = store.begin_read("client")?;
    let parts: i64 = tx
        .conn()
        .query_row("SELECT COUNT(*) FROM parts", [], |row| row.get(0))?;
    assert_eq!(parts, 0);
    assert!(tx.items(&ItemFilter::in_collections(&[root.clone()]))?.is_empty());
    tx.rollback()?;
    assert!(files.iter().all(|name| !store.part_store().exists(name)));
    Ok(())
}

#[test]
fn test_reopen_removes_stray_part_files() -> Result<()> {
    let (dir, store, root) = open_store()?;
    let mut tx = store.begin("client")?;
    let mut item = Item::new(root.id, "message/rfc822");
    tx.append_item(&mut item, &[Part::new("PLD:RFC822", b"a payload larger than the threshold".to_vec())])?;
    tx.commit()?;
    let stray = store.part_store().put(9_999, 0, b"left over from a crash")?;
    drop(store);

    let config = StorageConfig {
        external_threshold: 16,
        ..StorageConfig::default()
    };
    let store = Store::open(dir.path(), &config)?;
    assert!(!store.part_store().exists(&stray));
    let tx = store.begin_read("client")?;
    let kept = tx.referenced_part_files()?;
    assert_eq!(kept.len(), 1);
    assert!(kept.iter().all(|name| store.part_store().exists(name)));
    tx.rollback()?;
    Ok(())
}

#[test]
fn test_removing_populated_collection_announces_items() -> Result<()> {
    let (_dir, store, root) = open_store()?;
    let mut tx = store.begin("client")?;
    let mut folder = Collection::new("Archive", Some(root.id));
    tx.append_collection(&mut folder)?;
    let mut nested = Collection::new("2024", Some(folder.id));
    tx.append_collection(&mut nested)?;
    let mut ids = Vec::new();
    for collection in [folder.id, nested.id] {
        let mut item = Item::new(collection, "message/rfc822");
        tx.append_item(&mut item, &[])?;
        ids.push(item.id);
    }
    tx.commit()?;

    let provider = Arc::new(FixedProvider(Mutex::new(BTreeSet::from([ids[1]]))));
    let manager = SearchManager::new(
        Arc::clone(&store),
        provider as Arc<dyn SearchProvider>,
        &SearchConfig::default(),
    );
    let search = manager.create_persistent(
        "client",
        "Saved",
        broker::models::SearchSpec {
            query: "2024".into(),
            ..Default::default()
        },
    )?;

    let mut monitor = store.bus().monitor(MonitorFilter::kinds([EntityKind::Items]))?;
    let mut tx = store.begin("client")?;
    tx.remove_collection(folder.id)?;
    tx.commit()?;

    let received: Vec<_> = std::iter::from_fn(|| monitor.try_recv()).collect();
    let changes: Vec<_> = received.iter().filter_map(|n| n.item()).collect();
    let unlinked: Vec<_> = changes
        .iter()
        .filter(|c| c.operation == ItemOperation::Unlink)
        .collect();
    assert_eq!(unlinked.len(), 1);
    assert_eq!(unlinked[0].collection, search.id);
    assert_eq!(unlinked[0].item_ids().collect::<Vec<_>>(), vec![ids[1]]);
    let removed: BTreeSet<ItemId> = changes
        .iter()
        .filter(|c| c.operation == ItemOperation::Remove)
        .flat_map(|c| c.item_ids())
        .collect();
    assert_eq!(removed, ids.iter().copied().collect());

    let tx = store.begin_read("client")?;
    assert!(tx.linked_item_ids(search.id)?.is_empty());
    tx.rollback()?;
    Ok(())
}

#[test]
fn test_monitors_see_commits_once_and_rollbacks_never() -> Result<()> {
    let (_dir, store, root) = open_store()?;
    let mut everything = store.bus().monitor(MonitorFilter::all())?;
    let mut collections = store.bus().monitor(MonitorFilter::kinds([EntityKind::Collections]))?;

    let mut tx = store.begin("client")?;
    let mut sent = Collection::new("Sent", Some(root.id));
    tx.append_collection(&mut sent)?;
    tx.commit()?;

    let mut tx = store.begin("client")?;
    let mut drafts = Collection::new("Drafts", Some(root.id));
    tx.append_collection(&mut drafts)?;
    tx.rollback()?;

    for monitor in [&mut everything, &mut collections] {
        let received: Vec<_> = std::iter::from_fn(|| monitor.try_recv()).collect();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].collection().map(|c| c.id), Some(sent.id));
    }
    Ok(())
}

#[test]
fn test_sequences_continue_after_reopen() -> Result<()> {
    let (dir, store, root) = open_store()?;
    let mut monitor = store.bus().monitor(MonitorFilter::all())?;
    let mut tx = store.begin("client")?;
    tx.append_collection(&mut Collection::new("Sent", Some(root.id)))?;
    tx.commit()?;
    let before = monitor.try_recv().map(|n| n.sequence).unwrap_or_default();
    assert!(before > 0);
    drop(monitor);
    drop(store);

    let store = Arc::new(Store::open(dir.path(), &StorageConfig::default())?);
    let mut monitor = store.bus().monitor(MonitorFilter::all())?;
    let mut tx = store.begin("client")?;
    tx.append_collection(&mut Collection::new("Drafts", Some(root.id)))?;
    tx.commit()?;
    let after = monitor.try_recv().map(|n| n.sequence).unwrap_or_default();
    assert!(after > before);
    Ok(())
}

#[test]
fn test_decoder_recovers_after_bad_frame_with_literal() {
    let mut buffer = BytesMut::from(
        &b"a1 APPEND 2 text/plain (PARTS (PLD:RFC822 {13}\r\nx9 DELETE 3\r\n)) \"bad\\q\"\r\na2 LOGOUT\r\n"[..],
    );
    match decode_frame(&mut buffer) {
        DecodeResult::Invalid(err) => assert_eq!(err.tag.as_deref(), Some("a1")),
        other => panic!("expected invalid frame, got {:?}", other),
    }
    match decode_frame(&mut buffer) {
        DecodeResult::Complete(frame) => {
            assert_eq!(frame.tag, "a2");
            assert_eq!(frame.name, "LOGOUT");
        }
        other => panic!("expected LOGOUT, got {:?}", other),
    }
    assert!(buffer.is_empty());
}

#[test]
fn test_repeated_sync_requests_merge() -> Result<()> {
    let manager = ResourceManager::from_manifest(SchedulerConfig::default(), &online_manifest("imap"));
    let first = manager.synchronize("imap", TaskKind::SyncAll)?;
    let second = manager.synchronize("imap", TaskKind::SyncAll)?;

    assert!(matches!(first, Scheduled::Queued(_)));
    assert_eq!(second, Scheduled::Merged(first.serial().unwrap_or_default()));
    let status = manager.status("imap")?.expect("manifest resource");
    assert_eq!(status.queued, 1);
    Ok(())
}

/// Provider whose result set the test swaps between reconciliations
struct FixedProvider(Mutex<BTreeSet<ItemId>>);

impl SearchProvider for FixedProvider {
    fn search(&self, _request: &SearchRequest) -> Result<BTreeSet<ItemId>> {
        Ok(self.0.lock().map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?.clone())
    }
}

#[test]
fn test_persistent_search_matches_provider() -> Result<()> {
    let (_dir, store, root) = open_store()?;
    let mut tx = store.begin("client")?;
    let mut ids = Vec::new();
    for n in 0..3 {
        let mut item = Item::new(root.id, "message/rfc822").with_remote_id(format!("m{}", n));
        tx.append_item(&mut item, &[])?;
        ids.push(item.id);
    }
    tx.commit()?;

    let provider = Arc::new(FixedProvider(Mutex::new(BTreeSet::from([ids[0], ids[1]]))));
    let manager = SearchManager::new(
        Arc::clone(&store),
        Arc::clone(&provider) as Arc<dyn SearchProvider>,
        &SearchConfig::default(),
    );

    let search = manager.create_persistent(
        "client",
        "Important",
        broker::models::SearchSpec {
            query: "is:flagged".into(),
            ..Default::default()
        },
    )?;

    *provider.0.lock().map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))? =
        BTreeSet::from([ids[1], ids[2]]);
    assert_eq!(manager.refresh_all()?, 1);

    let tx = store.begin_read("client")?;
    assert_eq!(tx.linked_item_ids(search.id)?, BTreeSet::from([ids[1], ids[2]]));
    let items: i64 = tx
        .conn()
        .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
    assert_eq!(items, 3);
    tx.rollback()?;
    Ok(())
}

async fn read_until(stream: &mut TcpStream, marker: &str) -> Result<String> {
    let mut text = String::new();
    let mut chunk = [0u8; 4096];
    while !text.contains(marker) {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk)).await??;
        if n == 0 {
            break;
        }
        text.push_str(&String::from_utf8_lossy(&chunk[..n]));
    }
    Ok(text)
}

#[tokio::test]
async fn test_client_session_over_tcp() -> Result<()> {
    let dir = tempdir()?;
    let broker = Broker::open(BrokerConfig::in_dir(dir.path()), &online_manifest("imap"))?;
    let server = Server::bind_to(broker, "127.0.0.1:0").await?;
    let addr = server.local_addr()?;
    let (stop, shutdown) = watch::channel(false);
    let running = tokio::spawn(server.run(shutdown));

    let mut client = TcpStream::connect(addr).await?;
    read_until(&mut client, "\r\n").await?;

    client
        .write_all(
            b"a1 LOGIN kmail\r\n\
              a2 SELECT-RESOURCE imap\r\n\
              a3 CREATE \"IMAP\" 0 (REMOTEID \"root\")\r\n\
              a4 CREATE \"Inbox\" 1 (REMOTEID \"inbox\" CACHEPOLICY (INHERIT false INTERVAL 5 CACHETIMEOUT 10 SYNCONDEMAND false LOCALPARTS (ALL)))\r\n",
        )
        .await?;
    let text = read_until(&mut client, "a4 OK").await?;
    assert!(text.contains("a3 OK"));

    // the literal carries a CRLF the quoted form could not
    client
        .write_all(
            b"a5 APPEND RID \"inbox\" \"message/rfc822\" (REMOTEID \"m1\" PARTS (PLD:RFC822 {7}\r\nhi\r\nyou))\r\n\
              a6 STORE UID 1 (+FLAGS (\\SEEN))\r\n\
              a7 FETCH COLLECTION RID \"inbox\" (FULLPAYLOAD)\r\n",
        )
        .await?;
    let text = read_until(&mut client, "a7 OK").await?;
    assert!(text.contains("a5 OK"));
    assert!(text.contains("a6 OK"));
    assert!(text.contains("* ITEM 1"));
    assert!(text.contains("\\SEEN"));
    assert!(text.contains("{7}\r\nhi\r\nyou"));

    client.write_all(b"a8 LIST 2 0\r\na9 LOGOUT\r\n").await?;
    let text = read_until(&mut client, "a9 OK").await?;
    assert!(text.contains("NAME \"Inbox\""));
    assert!(text.contains("CACHEPOLICY (INHERIT FALSE INTERVAL 5 CACHETIMEOUT 10"));
    assert!(text.contains("* BYE"));

    stop.send(true)?;
    running.await??;
    Ok(())
}

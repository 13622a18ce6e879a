//! Cache-expiry sweep
//!
//! Walks collections whose effective cache policy has a timeout and drops
//! payload parts of items nobody accessed within it. Each collection is
//! purged in its own short transaction and the sweep yields in between.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use tokio::sync::watch;

use super::timetable::CollectionTimetable;
use crate::config::CacheConfig;
use crate::models::CollectionId;
use crate::storage::Store;

/// Session name the sweep's transactions run under
pub const CLEANER_SESSION: &str = "cache-cleaner";

/// Statistics from one sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    /// Collections examined
    pub collections: usize,
    /// Items that lost payload
    pub items: usize,
    /// Parts purged
    pub parts: usize,
    /// Collections that failed and were skipped
    pub errors: usize,
}

/// Clears `running` when the sweep ends, however it ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct CacheCleaner {
    store: Arc<Store>,
    timetable: Mutex<CollectionTimetable>,
    running: AtomicBool,
    config: CacheConfig,
}

impl CacheCleaner {
    pub fn new(store: Arc<Store>, config: CacheConfig) -> Self {
        Self {
            store,
            timetable: Mutex::new(CollectionTimetable::new(config.minimum_interval_minutes)),
            running: AtomicBool::new(false),
            config,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Rebuild the timetable from the current effective policies
    pub fn refresh(&self, now: DateTime<Utc>) -> Result<usize> {
        let policies = {
            let tx = self.store.begin_read(CLEANER_SESSION)?;
            let policies = tx.effective_cache_policies()?;
            tx.rollback()?;
            policies
        };
        let wanted: Vec<(CollectionId, i32)> = policies
            .into_iter()
            .filter(|(_, policy)| policy.expires_payload())
            .map(|(collection, policy)| (collection.id, policy.cache_timeout))
            .collect();
        let mut timetable = self
            .timetable
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?;
        timetable.rebuild(wanted, now);
        Ok(timetable.len())
    }

    /// Collections due for a sweep at `now`
    pub fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<CollectionId>> {
        let mut timetable = self
            .timetable
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?;
        Ok(timetable.take_due(now))
    }

    /// Purge expired payload of one collection; returns (items, parts)
    pub fn purge_collection(&self, id: CollectionId, now: DateTime<Utc>) -> Result<(usize, usize)> {
        let mut tx = self.store.begin(CLEANER_SESSION)?;
        let Some(collection) = tx.collection(id)? else {
            return Ok((0, 0));
        };
        let policy = tx.effective_cache_policy(&collection)?;
        if !policy.expires_payload() {
            return Ok((0, 0));
        }
        let cutoff = now - Duration::minutes(policy.cache_timeout as i64);
        let candidates = tx.expiry_candidates(id, cutoff, &policy)?;
        if candidates.is_empty() {
            return Ok((0, 0));
        }
        let parts = tx.purge_payload(&candidates)?;
        tx.commit()?;
        debug!(
            "Purged {} parts of {} items in collection {}",
            parts,
            candidates.len(),
            id
        );
        Ok((candidates.len(), parts))
    }

    /// Sweep the given collections unless a sweep is already running
    pub async fn sweep(self: &Arc<Self>, collections: Vec<CollectionId>) -> Result<SweepStats> {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("Cache sweep already running, skipping");
            return Ok(SweepStats::default());
        }
        let _guard = RunningGuard(&self.running);

        let now = Utc::now();
        let mut stats = SweepStats::default();
        for id in collections {
            let cleaner = Arc::clone(self);
            let result =
                tokio::task::spawn_blocking(move || cleaner.purge_collection(id, now)).await?;
            stats.collections += 1;
            match result {
                Ok((items, parts)) => {
                    stats.items += items;
                    stats.parts += parts;
                }
                Err(e) => {
                    warn!("Cache sweep of collection {} failed: {:#}", id, e);
                    stats.errors += 1;
                }
            }
            tokio::task::yield_now().await;
        }
        if stats.parts > 0 {
            info!(
                "Cache sweep purged {} parts of {} items",
                stats.parts, stats.items
            );
        }
        Ok(stats)
    }

    /// Refresh the timetable and sweep whatever is due
    pub async fn sweep_due(self: &Arc<Self>) -> Result<SweepStats> {
        let cleaner = Arc::clone(self);
        let due = tokio::task::spawn_blocking(move || -> Result<Vec<CollectionId>> {
            let now = Utc::now();
            cleaner.refresh(now)?;
            cleaner.take_due(now)
        })
        .await??;
        if due.is_empty() {
            return Ok(SweepStats::default());
        }
        self.sweep(due).await
    }

    /// Periodic loop at the configured granularity
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Cache sweep disabled");
            return;
        }
        let period = std::time::Duration::from_secs(60 * self.config.granularity_minutes.max(1) as u64);
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_due().await {
                        warn!("Cache sweep failed: {:#}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Cache sweep stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::models::{CachePolicy, Collection, Item, ItemId, Part, parts};
    use tempfile::{TempDir, tempdir};

    fn setup(policy: CachePolicy) -> (TempDir, Arc<CacheCleaner>, CollectionId, ItemId) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path(), &StorageConfig::default()).unwrap());
        let mut tx = store.begin("test").unwrap();
        let mut root = Collection::new("imap", None).with_cache_policy(policy);
        root.resource = "imap".into();
        tx.append_collection(&mut root).unwrap();
        let mut item = Item::new(root.id, "message/rfc822");
        tx.append_item(
            &mut item,
            &[
                Part::new(parts::FULL_PAYLOAD, b"body".to_vec()),
                Part::new("PLD:HEAD", b"head".to_vec()),
            ],
        )
        .unwrap();
        tx.commit().unwrap();
        let cleaner = Arc::new(CacheCleaner::new(store, CacheConfig::default()));
        (dir, cleaner, root.id, item.id)
    }

    fn expiring(local_parts: &[&str]) -> CachePolicy {
        CachePolicy {
            inherit: false,
            check_interval: -1,
            cache_timeout: 10,
            sync_on_demand: false,
            local_parts: local_parts.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn test_purge_keeps_local_parts() {
        let (_dir, cleaner, collection, item) = setup(expiring(&["PLD:HEAD"]));
        let later = Utc::now() + Duration::minutes(11);
        assert_eq!(cleaner.purge_collection(collection, later).unwrap(), (1, 1));

        let tx = cleaner.store.begin_read("test").unwrap();
        let missing = tx
            .missing_parts(item, &[parts::FULL_PAYLOAD.to_string(), "PLD:HEAD".to_string()].into())
            .unwrap();
        assert_eq!(missing, [parts::FULL_PAYLOAD.to_string()].into());
        // metadata survives
        assert_eq!(tx.require_item(item).unwrap().revision, 0);
    }

    #[test]
    fn test_recent_access_is_kept() {
        let (_dir, cleaner, collection, _) = setup(expiring(&[]));
        assert_eq!(cleaner.purge_collection(collection, Utc::now()).unwrap(), (0, 0));
    }

    #[test]
    fn test_keep_all_policy_is_not_scheduled() {
        let (_dir, cleaner, _, _) = setup(CachePolicy::system_default());
        assert_eq!(cleaner.refresh(Utc::now()).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_due_collections() {
        let (_dir, cleaner, collection, _) = setup(expiring(&[]));
        assert_eq!(cleaner.refresh(Utc::now()).unwrap(), 1);
        assert!(cleaner.take_due(Utc::now()).unwrap().is_empty());

        let stats = cleaner.sweep(vec![collection]).await.unwrap();
        assert_eq!(stats.collections, 1);
        assert!(!cleaner.is_running());
    }

    #[tokio::test]
    async fn test_sweep_does_not_overlap() {
        let (_dir, cleaner, collection, _) = setup(expiring(&[]));
        cleaner.running.store(true, Ordering::Release);
        let stats = cleaner.sweep(vec![collection]).await.unwrap();
        assert_eq!(stats, SweepStats::default());
    }
}

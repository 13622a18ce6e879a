//! Interval checks and on-demand collection syncs
//!
//! Collections whose effective policy sets a check interval are synced
//! through the resource scheduler on that schedule. Listing a collection
//! with sync-on-demand also asks for a sync, at most once per cooldown.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::watch;

use super::timetable::CollectionTimetable;
use crate::config::{CacheConfig, SchedulerConfig};
use crate::models::{CachePolicy, Collection, CollectionId, parts};
use crate::scheduler::{ResourceManager, Scheduled, TaskKind};
use crate::storage::{SEARCH_RESOURCE, Store};

const CHECKER_SESSION: &str = "interval-check";

/// Whether enough time has passed since `last_sync_at` to sync again.
/// Never having synced counts as elapsed.
pub fn cooldown_elapsed(
    last_sync_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown_secs: u64,
) -> bool {
    match last_sync_at {
        Some(last) => (now - last).num_seconds() >= cooldown_secs as i64,
        None => true,
    }
}

/// Payload parts a collection sync should bring in under `policy`
fn sync_parts(policy: &CachePolicy) -> BTreeSet<String> {
    policy
        .local_parts
        .iter()
        .filter(|p| parts::is_payload(p))
        .cloned()
        .collect()
}

pub struct IntervalChecker {
    store: Arc<Store>,
    resources: Arc<ResourceManager>,
    timetable: Mutex<CollectionTimetable>,
    last_sync: Mutex<HashMap<CollectionId, DateTime<Utc>>>,
    cooldown_secs: u64,
    granularity_minutes: u32,
}

impl IntervalChecker {
    pub fn new(
        store: Arc<Store>,
        resources: Arc<ResourceManager>,
        cache: &CacheConfig,
        scheduler: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            resources,
            timetable: Mutex::new(CollectionTimetable::new(cache.minimum_interval_minutes)),
            last_sync: Mutex::new(HashMap::new()),
            cooldown_secs: scheduler.sync_cooldown_secs,
            granularity_minutes: cache.granularity_minutes,
        }
    }

    fn lock_timetable(&self) -> Result<std::sync::MutexGuard<'_, CollectionTimetable>> {
        self.timetable
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))
    }

    fn request(&self, collection: &Collection, policy: &CachePolicy, now: DateTime<Utc>) -> Result<Scheduled> {
        let scheduled = self.resources.synchronize(
            &collection.resource,
            TaskKind::SyncCollection {
                collection: collection.id,
                parts: sync_parts(policy),
            },
        )?;
        self.last_sync
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?
            .insert(collection.id, now);
        Ok(scheduled)
    }

    /// Rebuild the timetable from the current effective policies
    pub fn refresh(&self, now: DateTime<Utc>) -> Result<usize> {
        let policies = {
            let tx = self.store.begin_read(CHECKER_SESSION)?;
            let policies = tx.effective_cache_policies()?;
            tx.rollback()?;
            policies
        };
        let wanted: Vec<(CollectionId, i32)> = policies
            .into_iter()
            .filter(|(collection, policy)| {
                policy.has_check_interval() && collection.resource != SEARCH_RESOURCE
            })
            .map(|(collection, policy)| (collection.id, policy.check_interval))
            .collect();
        let mut timetable = self.lock_timetable()?;
        timetable.rebuild(wanted, now);
        Ok(timetable.len())
    }

    /// Schedule syncs for every collection whose check is due
    pub fn check_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.lock_timetable()?.take_due(now);
        if due.is_empty() {
            return Ok(0);
        }

        let mut targets = Vec::new();
        {
            let tx = self.store.begin_read(CHECKER_SESSION)?;
            for id in due {
                if let Some(collection) = tx.collection(id)? {
                    let policy = tx.effective_cache_policy(&collection)?;
                    targets.push((collection, policy));
                }
            }
            tx.rollback()?;
        }

        let mut scheduled = 0;
        for (collection, policy) in targets {
            match self.request(&collection, &policy, now) {
                Ok(Scheduled::Offline) => {}
                Ok(_) => scheduled += 1,
                Err(e) => warn!("Interval sync of collection {} failed: {:#}", collection.id, e),
            }
        }
        if scheduled > 0 {
            debug!("Interval check scheduled {} collection syncs", scheduled);
        }
        Ok(scheduled)
    }

    /// Sync a collection a client is listing, if its policy asks for it and
    /// the cooldown has passed. Returns whether a sync was requested.
    pub fn sync_on_demand(
        &self,
        collection: &Collection,
        policy: &CachePolicy,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !policy.sync_on_demand || collection.is_virtual {
            return Ok(false);
        }
        let last = self
            .last_sync
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?
            .get(&collection.id)
            .copied();
        if !cooldown_elapsed(last, now, self.cooldown_secs) {
            return Ok(false);
        }
        let scheduled = self.request(collection, policy, now)?;
        Ok(scheduled != Scheduled::Offline)
    }

    /// Periodic loop at the configured granularity
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = std::time::Duration::from_secs(60 * self.granularity_minutes.max(1) as u64);
        let mut interval = tokio::time::interval(period);
        info!("Interval check every {:?}", period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let checker = Arc::clone(&self);
                    let result = tokio::task::spawn_blocking(move || -> Result<usize> {
                        let now = Utc::now();
                        checker.refresh(now)?;
                        checker.check_due(now)
                    })
                    .await;
                    match result {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!("Interval check failed: {:#}", e),
                        Err(e) => warn!("Interval check panicked: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Interval check stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::scheduler::ResourceState;
    use chrono::Duration;
    use tempfile::{TempDir, tempdir};

    #[test]
    fn test_cooldown_elapsed_never_synced() {
        assert!(cooldown_elapsed(None, Utc::now(), 30));
        assert!(cooldown_elapsed(None, Utc::now(), 0));
    }

    #[test]
    fn test_cooldown_elapsed_recent_and_old() {
        let now = Utc::now();
        assert!(!cooldown_elapsed(Some(now - Duration::seconds(10)), now, 30));
        assert!(cooldown_elapsed(Some(now - Duration::seconds(30)), now, 30));
        assert!(cooldown_elapsed(Some(now - Duration::hours(24)), now, 60));
        assert!(cooldown_elapsed(Some(now), now, 0));
    }

    fn policy(check_interval: i32, sync_on_demand: bool) -> CachePolicy {
        CachePolicy {
            inherit: false,
            check_interval,
            cache_timeout: -1,
            sync_on_demand,
            local_parts: vec![parts::FULL_PAYLOAD.to_string()],
        }
    }

    fn setup(policy: CachePolicy) -> (TempDir, IntervalChecker, Collection) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path(), &StorageConfig::default()).unwrap());
        let mut tx = store.begin("test").unwrap();
        let mut root = Collection::new("imap", None).with_cache_policy(policy);
        root.resource = "imap".into();
        tx.append_collection(&mut root).unwrap();
        tx.commit().unwrap();
        let resources = Arc::new(ResourceManager::new(SchedulerConfig::default()));
        let checker = IntervalChecker::new(
            store,
            resources,
            &CacheConfig::default(),
            &SchedulerConfig::default(),
        );
        (dir, checker, root)
    }

    #[test]
    fn test_due_collection_is_synced_once() {
        let (_dir, checker, _root) = setup(policy(10, false));
        let now = Utc::now();
        assert_eq!(checker.refresh(now).unwrap(), 1);
        assert_eq!(checker.check_due(now).unwrap(), 0);

        let later = now + Duration::minutes(10);
        assert_eq!(checker.check_due(later).unwrap(), 1);
        let status = checker.resources.status("imap").unwrap().unwrap();
        assert_eq!(status.state, ResourceState::TaskQueued);
        assert_eq!(status.queued, 1);

        // a second due pass merges into the queued sync
        checker.check_due(later + Duration::minutes(10)).unwrap();
        assert_eq!(checker.resources.status("imap").unwrap().unwrap().queued, 1);
    }

    #[test]
    fn test_sync_on_demand_respects_cooldown() {
        let (_dir, checker, root) = setup(policy(-1, true));
        let p = policy(-1, true);
        let now = Utc::now();
        assert!(checker.sync_on_demand(&root, &p, now).unwrap());
        assert!(!checker.sync_on_demand(&root, &p, now + Duration::seconds(5)).unwrap());
        assert!(checker.sync_on_demand(&root, &p, now + Duration::minutes(5)).unwrap());
    }

    #[test]
    fn test_no_sync_without_on_demand() {
        let (_dir, checker, root) = setup(policy(-1, false));
        assert!(!checker.sync_on_demand(&root, &policy(-1, false), Utc::now()).unwrap());
        assert_eq!(checker.refresh(Utc::now()).unwrap(), 0);
    }
}

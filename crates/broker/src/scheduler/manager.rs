//! Resource registry and task dispatch
//!
//! Owns one [`ResourceScheduler`] per resource. Adapters connect over the
//! protocol and register with `RESOURCE-REGISTER`; the manager then pushes
//! tasks to them through a [`ResourceAdapter`] handle. Locks are never held
//! while a task is handed to an adapter.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::Result;
use log::{debug, info, warn};
use tokio::sync::{oneshot, watch};

use super::resource::{
    ResourceScheduler, ResourceState, Scheduled, TaskKind, TaskOutcome, TaskRequest,
};
use crate::config::{ResourceManifest, SchedulerConfig};
use crate::error::BrokerError;
use crate::models::ItemId;

/// Connection to a resource adapter
pub trait ResourceAdapter: Send + Sync {
    /// Hand a task to the adapter; `false` means the adapter is gone
    fn dispatch(&self, task: &TaskRequest) -> bool;
}

/// Snapshot of one resource for status queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceStatus {
    pub name: String,
    pub online: bool,
    pub connected: bool,
    pub state: ResourceState,
    pub queued: usize,
}

struct Registered {
    scheduler: ResourceScheduler,
    adapter: Option<Arc<dyn ResourceAdapter>>,
    /// Connection id that owns the adapter handle
    owner: Option<u64>,
}

pub struct ResourceManager {
    resources: Mutex<HashMap<String, Registered>>,
    next_serial: AtomicU64,
    config: SchedulerConfig,
}

impl ResourceManager {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            resources: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
            config,
        }
    }

    /// Manager pre-populated with the resources of a manifest
    pub fn from_manifest(config: SchedulerConfig, manifest: &ResourceManifest) -> Self {
        let manager = Self::new(config);
        if let Ok(mut resources) = manager.lock() {
            for entry in &manifest.resources {
                resources.insert(
                    entry.name.clone(),
                    Registered {
                        scheduler: ResourceScheduler::new(
                            &entry.name,
                            entry.online,
                            manager.config.clone(),
                        ),
                        adapter: None,
                        owner: None,
                    },
                );
            }
        }
        manager
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Registered>>> {
        self.resources
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))
    }

    fn entry<'a>(
        &self,
        resources: &'a mut HashMap<String, Registered>,
        name: &str,
    ) -> &'a mut Registered {
        resources.entry(name.to_string()).or_insert_with(|| Registered {
            scheduler: ResourceScheduler::new(name, true, self.config.clone()),
            adapter: None,
            owner: None,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Attach the adapter connection `owner` to `resource`
    pub fn register_adapter(
        &self,
        resource: &str,
        owner: u64,
        adapter: Arc<dyn ResourceAdapter>,
    ) -> Result<()> {
        {
            let mut resources = self.lock()?;
            let registered = self.entry(&mut resources, resource);
            if registered.adapter.is_some() && registered.owner != Some(owner) {
                return Err(BrokerError::constraint(format!(
                    "Resource {} already has an adapter",
                    resource
                ))
                .into());
            }
            registered.adapter = Some(adapter);
            registered.owner = Some(owner);
        }
        info!("Adapter registered for resource {}", resource);
        self.pump(resource)
    }

    /// Detach the adapter if `owner` still holds it; a running task fails
    pub fn adapter_disconnected(&self, resource: &str, owner: u64) -> Result<()> {
        {
            let mut resources = self.lock()?;
            let Some(registered) = resources.get_mut(resource) else {
                return Ok(());
            };
            if registered.owner != Some(owner) {
                return Ok(());
            }
            registered.adapter = None;
            registered.owner = None;
            registered.scheduler.adapter_lost(Instant::now());
        }
        info!("Adapter for resource {} disconnected", resource);
        Ok(())
    }

    /// Queue a background task
    pub fn synchronize(&self, resource: &str, kind: TaskKind) -> Result<Scheduled> {
        let scheduled = self.schedule(resource, kind, None)?;
        self.pump(resource)?;
        Ok(scheduled)
    }

    /// Queue an interactive fetch and return the receiver its outcome is
    /// sent to
    pub fn fetch_items(
        &self,
        resource: &str,
        items: BTreeSet<ItemId>,
        parts: BTreeSet<String>,
    ) -> Result<oneshot::Receiver<TaskOutcome>> {
        let (tx, rx) = oneshot::channel();
        self.schedule(resource, TaskKind::FetchItems { items, parts }, Some(tx))?;
        self.pump(resource)?;
        Ok(rx)
    }

    fn schedule(
        &self,
        resource: &str,
        kind: TaskKind,
        waiter: Option<oneshot::Sender<TaskOutcome>>,
    ) -> Result<Scheduled> {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let mut resources = self.lock()?;
        Ok(self
            .entry(&mut resources, resource)
            .scheduler
            .schedule(kind, serial, waiter))
    }

    pub fn set_online(&self, resource: &str, online: bool) -> Result<usize> {
        let dropped = {
            let mut resources = self.lock()?;
            self.entry(&mut resources, resource).scheduler.set_online(online)
        };
        if online {
            self.pump(resource)?;
        }
        Ok(dropped)
    }

    pub fn heartbeat(&self, resource: &str, serial: u64) -> Result<bool> {
        let mut resources = self.lock()?;
        Ok(resources
            .get_mut(resource)
            .is_some_and(|r| r.scheduler.heartbeat(serial, Instant::now())))
    }

    /// Adapter reports a task finished, then the next one is started
    pub fn task_done(&self, resource: &str, serial: u64, error: Option<String>) -> Result<bool> {
        let completed = {
            let mut resources = self.lock()?;
            resources
                .get_mut(resource)
                .is_some_and(|r| r.scheduler.complete(serial, error, Instant::now()))
        };
        if completed {
            self.pump(resource)?;
        }
        Ok(completed)
    }

    /// Start the next task of `resource` if it is idle and connected
    pub fn pump(&self, resource: &str) -> Result<()> {
        let (task, adapter) = {
            let mut resources = self.lock()?;
            let Some(registered) = resources.get_mut(resource) else {
                return Ok(());
            };
            let Some(adapter) = registered.adapter.clone() else {
                return Ok(());
            };
            match registered.scheduler.next_task(Instant::now()) {
                Some(task) => (task, adapter),
                None => return Ok(()),
            }
        };

        debug!("Dispatching task {} to {}", task.serial, resource);
        if !adapter.dispatch(&task) {
            warn!("Adapter for {} is gone, failing task {}", resource, task.serial);
            let mut resources = self.lock()?;
            if let Some(registered) = resources.get_mut(resource) {
                registered.adapter = None;
                registered.owner = None;
                registered.scheduler.adapter_lost(Instant::now());
            }
        }
        Ok(())
    }

    /// Run the watchdog over every resource and start ready tasks
    pub fn tick(&self) -> Result<Vec<u64>> {
        let now = Instant::now();
        let (failed, names) = {
            let mut resources = self.lock()?;
            let mut failed = Vec::new();
            for registered in resources.values_mut() {
                failed.extend(registered.scheduler.check_watchdog(now));
            }
            (failed, resources.keys().cloned().collect::<Vec<_>>())
        };
        for name in names {
            self.pump(&name)?;
        }
        Ok(failed)
    }

    pub fn status(&self, resource: &str) -> Result<Option<ResourceStatus>> {
        let resources = self.lock()?;
        Ok(resources.get(resource).map(|r| ResourceStatus {
            name: resource.to_string(),
            online: r.scheduler.is_online(),
            connected: r.adapter.is_some(),
            state: r.scheduler.state(),
            queued: r.scheduler.queued(),
        }))
    }

    pub fn resource_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.lock()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Watchdog loop; ends when `shutdown` flips to true
    pub async fn run_watchdog(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick() {
                        Ok(failed) if !failed.is_empty() => {
                            warn!("Watchdog failed {} stalled tasks", failed.len());
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Watchdog tick failed: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Watchdog stopped");
    }
}

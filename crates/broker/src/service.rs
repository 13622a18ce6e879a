//! Broker context
//!
//! One [`Broker`] owns every long-lived component: the store, the resource
//! manager, the cache and interval checkers and the search stack. Handlers
//! and background loops reach them through an `Arc<Broker>`.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::{CacheCleaner, IntervalChecker};
use crate::config::{BrokerConfig, ResourceManifest};
use crate::scheduler::{ItemRetriever, ResourceManager};
use crate::search::{ItemIndex, SearchIndexer, SearchManager, SearchProvider};
use crate::storage::Store;

pub struct Broker {
    config: BrokerConfig,
    data_dir: PathBuf,
    store: Arc<Store>,
    resources: Arc<ResourceManager>,
    retriever: ItemRetriever,
    interval: Arc<IntervalChecker>,
    cleaner: Arc<CacheCleaner>,
    indexer: Arc<SearchIndexer>,
    search: Arc<SearchManager>,
    next_connection: AtomicU64,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("data_dir", &self.data_dir)
            .field("listen", &self.config.listen)
            .finish()
    }
}

impl Broker {
    /// Open the store and search index under the configured data directory
    pub fn open(config: BrokerConfig, manifest: &ResourceManifest) -> Result<Arc<Self>> {
        let data_dir = config.data_dir()?;
        let store = Arc::new(
            Store::open(&data_dir, &config.storage)
                .with_context(|| format!("Failed to open store in {:?}", data_dir))?,
        );

        let index_path = data_dir.join(&config.search.index_dir);
        let index = Arc::new(
            ItemIndex::open(&index_path)
                .with_context(|| format!("Failed to open search index at {:?}", index_path))?,
        );

        let resources = Arc::new(ResourceManager::from_manifest(
            config.scheduler.clone(),
            manifest,
        ));
        let retriever = ItemRetriever::new(Arc::clone(&resources), config.scheduler.adapter_timeout());
        let interval = Arc::new(IntervalChecker::new(
            Arc::clone(&store),
            Arc::clone(&resources),
            &config.cache,
            &config.scheduler,
        ));
        let cleaner = Arc::new(CacheCleaner::new(Arc::clone(&store), config.cache.clone()));
        let search = Arc::new(SearchManager::new(
            Arc::clone(&store),
            Arc::clone(&index) as Arc<dyn SearchProvider>,
            &config.search,
        ));
        let indexer = Arc::new(SearchIndexer::new(
            Arc::clone(&store),
            index,
            Some(Arc::clone(&search)),
        ));

        info!(
            "Broker opened in {:?} with {} configured resources",
            data_dir,
            manifest.resources.len()
        );

        Ok(Arc::new(Self {
            config,
            data_dir,
            store,
            resources,
            retriever,
            interval,
            cleaner,
            indexer,
            search,
            next_connection: AtomicU64::new(1),
        }))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn retriever(&self) -> &ItemRetriever {
        &self.retriever
    }

    pub fn interval(&self) -> &Arc<IntervalChecker> {
        &self.interval
    }

    pub fn cleaner(&self) -> &Arc<CacheCleaner> {
        &self.cleaner
    }

    pub fn indexer(&self) -> &Arc<SearchIndexer> {
        &self.indexer
    }

    pub fn search(&self) -> &Arc<SearchManager> {
        &self.search
    }

    /// Unique id for a new connection
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Start the watchdog, cache sweep, interval check, indexer and search
    /// updater; each stops when `shutdown` flips to true
    pub fn spawn_background(&self, shutdown: watch::Receiver<bool>) -> Result<Vec<JoinHandle<()>>> {
        let monitor = self.indexer.monitor()?;
        if self.indexer.index_is_empty() {
            let indexer = Arc::clone(&self.indexer);
            tokio::task::spawn_blocking(move || {
                if let Err(e) = indexer.reindex_all() {
                    warn!("Initial search indexing failed: {:#}", e);
                }
            });
        }

        Ok(vec![
            tokio::spawn(Arc::clone(&self.resources).run_watchdog(shutdown.clone())),
            tokio::spawn(Arc::clone(&self.cleaner).run(shutdown.clone())),
            tokio::spawn(Arc::clone(&self.interval).run(shutdown.clone())),
            tokio::spawn(Arc::clone(&self.indexer).run(monitor, shutdown.clone())),
            tokio::spawn(Arc::clone(&self.search).run(shutdown)),
        ])
    }
}

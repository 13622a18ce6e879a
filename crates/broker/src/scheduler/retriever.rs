//! On-demand payload retrieval
//!
//! A FETCH that needs parts missing from the cache asks the owning resource
//! for them and blocks its handler thread until the adapter reports the task
//! done or the adapter timeout elapses.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::debug;

use super::manager::ResourceManager;
use crate::error::BrokerError;
use crate::models::ItemId;

pub struct ItemRetriever {
    manager: Arc<ResourceManager>,
    timeout: Duration,
}

impl ItemRetriever {
    pub fn new(manager: Arc<ResourceManager>, timeout: Duration) -> Self {
        Self { manager, timeout }
    }

    /// Ask `resource` for `parts` of `items` and wait for it to deliver.
    ///
    /// Must run on a blocking thread inside a tokio runtime.
    pub fn retrieve(
        &self,
        resource: &str,
        items: BTreeSet<ItemId>,
        parts: BTreeSet<String>,
    ) -> Result<()> {
        debug!(
            "Retrieving {:?} of {} items from {}",
            parts,
            items.len(),
            resource
        );
        let receiver = self.manager.fetch_items(resource, items, parts)?;
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| BrokerError::unavailable(format!("Cannot wait for {}: {}", resource, e)))?;

        match handle.block_on(tokio::time::timeout(self.timeout, receiver)) {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(message))) => Err(BrokerError::unavailable(format!(
                "Resource {} could not deliver: {}",
                resource, message
            ))
            .into()),
            Ok(Err(_)) => Err(BrokerError::unavailable(format!(
                "Resource {} dropped the request",
                resource
            ))
            .into()),
            Err(_) => Err(BrokerError::unavailable(format!(
                "Resource {} did not respond within {:?}",
                resource, self.timeout
            ))
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::error::ErrorKind;
    use crate::scheduler::{ResourceAdapter, TaskRequest};
    use tokio::sync::mpsc;

    struct ChannelAdapter(mpsc::UnboundedSender<TaskRequest>);

    impl ResourceAdapter for ChannelAdapter {
        fn dispatch(&self, task: &TaskRequest) -> bool {
            self.0.send(task.clone()).is_ok()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retrieve_waits_for_task_done() {
        let manager = Arc::new(ResourceManager::new(SchedulerConfig::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .register_adapter("imap", 1, Arc::new(ChannelAdapter(tx)))
            .unwrap();

        let retriever = ItemRetriever::new(manager.clone(), Duration::from_secs(5));
        let waiting = tokio::task::spawn_blocking(move || {
            retriever.retrieve("imap", [ItemId(1)].into(), BTreeSet::new())
        });

        let task = rx.recv().await.unwrap();
        manager.task_done("imap", task.serial, None).unwrap();
        assert!(waiting.await.unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unresponsive_resource_is_unavailable() {
        let manager = Arc::new(ResourceManager::new(SchedulerConfig::default()));
        let retriever = ItemRetriever::new(manager, Duration::from_millis(50));
        let err = tokio::task::spawn_blocking(move || {
            retriever.retrieve("imap", [ItemId(1)].into(), BTreeSet::new())
        })
        .await
        .unwrap()
        .unwrap_err();
        assert_eq!(ErrorKind::classify(&err), ErrorKind::Unavailable);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_offline_resource_fails_fast() {
        let manager = Arc::new(ResourceManager::new(SchedulerConfig::default()));
        manager.set_online("imap", false).unwrap();
        let retriever = ItemRetriever::new(manager, Duration::from_secs(30));
        let started = std::time::Instant::now();
        let result = tokio::task::spawn_blocking(move || {
            retriever.retrieve("imap", [ItemId(1)].into(), BTreeSet::new())
        })
        .await
        .unwrap();
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(30));
    }
}

//! Notification distribution
//!
//! The bus is owned by the broker and shared through `Arc`. Committing
//! transactions stamp their events with sequence numbers and publish them
//! while holding the store's commit lock, so every subscriber sees events in
//! commit order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use log::{debug, trace};
use tokio::sync::mpsc;

use super::event::Notification;
use super::filter::MonitorFilter;

/// Receiving end of a subscription
pub trait NotificationSink: Send + Sync {
    /// Deliver one event; `false` means the subscriber is gone
    fn deliver(&self, notification: &Arc<Notification>) -> bool;
}

impl NotificationSink for mpsc::UnboundedSender<Arc<Notification>> {
    fn deliver(&self, notification: &Arc<Notification>) -> bool {
        self.send(Arc::clone(notification)).is_ok()
    }
}

pub type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    filter: MonitorFilter,
    sink: Box<dyn NotificationSink>,
}

pub struct NotificationBus {
    next_sequence: AtomicU64,
    next_subscriber: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl NotificationBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bus whose first stamped event gets `sequence`
    pub fn starting_at(sequence: u64) -> Self {
        Self {
            next_sequence: AtomicU64::new(sequence.max(1)),
            next_subscriber: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Sequence the most recently stamped event received
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst) - 1
    }

    /// Assign increasing sequence numbers
    pub fn stamp(&self, notifications: &mut [Notification]) {
        if notifications.is_empty() {
            return;
        }
        let first = self
            .next_sequence
            .fetch_add(notifications.len() as u64, Ordering::SeqCst);
        for (offset, notification) in notifications.iter_mut().enumerate() {
            notification.sequence = first + offset as u64;
        }
    }

    pub fn subscribe(&self, filter: MonitorFilter, sink: Box<dyn NotificationSink>) -> Result<SubscriberId> {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?;
        subscribers.push(Subscriber { id, filter, sink });
        debug!("Subscriber {} registered ({} total)", id, subscribers.len());
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> Result<bool> {
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?;
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        Ok(subscribers.len() != before)
    }

    pub fn set_filter(&self, id: SubscriberId, filter: MonitorFilter) -> Result<bool> {
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?;
        match subscribers.iter_mut().find(|s| s.id == id) {
            Some(subscriber) => {
                subscriber.filter = filter;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Fan out committed events; returns the number of deliveries
    pub fn publish(&self, notifications: Vec<Notification>) -> Result<usize> {
        if notifications.is_empty() {
            return Ok(0);
        }
        let notifications: Vec<Arc<Notification>> = notifications.into_iter().map(Arc::new).collect();
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?;

        let mut delivered = 0;
        let mut closed = Vec::new();
        for notification in &notifications {
            for subscriber in subscribers.iter() {
                if closed.contains(&subscriber.id) || !subscriber.filter.accepts(notification) {
                    continue;
                }
                if subscriber.sink.deliver(notification) {
                    delivered += 1;
                } else {
                    closed.push(subscriber.id);
                }
            }
        }
        if !closed.is_empty() {
            debug!("Dropping {} closed subscribers", closed.len());
            subscribers.retain(|s| !closed.contains(&s.id));
        }
        trace!(
            "Published {} events with {} deliveries",
            notifications.len(),
            delivered
        );
        Ok(delivered)
    }

    /// Subscribe through a channel; dropping the handle unsubscribes
    pub fn monitor(self: &Arc<Self>, filter: MonitorFilter) -> Result<Monitor> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(filter, Box::new(tx))?;
        Ok(Monitor {
            id,
            bus: Arc::clone(self),
            receiver: rx,
        })
    }
}

/// Live subscription handle
pub struct Monitor {
    id: SubscriberId,
    bus: Arc<NotificationBus>,
    receiver: mpsc::UnboundedReceiver<Arc<Notification>>,
}

impl Monitor {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Arc<Notification>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Notification>> {
        self.receiver.try_recv().ok()
    }

    pub fn blocking_recv(&mut self) -> Option<Arc<Notification>> {
        self.receiver.blocking_recv()
    }

    pub fn set_filter(&self, filter: MonitorFilter) -> Result<bool> {
        self.bus.set_filter(self.id, filter)
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        let _ = self.bus.unsubscribe(self.id);
    }
}

//! In-process message bus.
//!
//! Implements the subscription source and description publisher contracts
//! of `thinglog-api` so the recorder can run without an external broker.
//! Every subscription owns a bounded queue drained by its own task; the
//! callback runs on the blocking pool, one message at a time, so a
//! subscription sees messages in publish order while different
//! subscriptions run concurrently.

pub mod error;
pub mod ingest;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use thinglog_api::{
    ApiError, BoxFuture, Connection, Delivery, DescriptionPublisher, MessageHandler,
    ServiceDescription, SubscriptionSource, SubscriptionToken, TopicFilter,
};

pub use error::BusError;

/// Message type used when a service description is published on the bus.
pub const DESCRIPTION_MESSAGE_TYPE: &str = "description";

// ═══════════════════════════════════════════════════════════════
//  Config
// ═══════════════════════════════════════════════════════════════

/// What to do when a subscriber queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// try_send(): drop the message for that subscriber and log it.
    Drop,
    /// send().await: the publisher waits for room.
    #[serde(alias = "backpressure")]
    BackPressure,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Per-subscription queue length.
    #[serde(default = "default_buffer")]
    pub buffer: usize,
    #[serde(default = "default_overflow")]
    pub overflow: OverflowPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            buffer: default_buffer(),
            overflow: default_overflow(),
        }
    }
}

fn default_buffer() -> usize {
    1024
}

fn default_overflow() -> OverflowPolicy {
    OverflowPolicy::BackPressure
}

// ═══════════════════════════════════════════════════════════════
//  Subscriber
// ═══════════════════════════════════════════════════════════════

struct Subscriber {
    connection: u64,
    filter: TopicFilter,
    tx: mpsc::Sender<Delivery>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscriber {
    /// Stop the delivery task and wait for an in-flight callback to return.
    async fn shutdown(self) {
        self.cancel.cancel();
        drop(self.tx);
        if let Err(e) = self.task.await {
            tracing::warn!(filter = %self.filter, error = %e, "delivery task ended abnormally");
        }
    }
}

fn spawn_delivery(
    filter: TopicFilter,
    mut rx: mpsc::Receiver<Delivery>,
    handler: MessageHandler,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(delivery) => {
                        let handler = handler.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || handler(delivery)).await {
                            tracing::warn!(filter = %filter, error = %e, "subscriber callback panicked");
                        }
                    }
                    None => break,
                },
            }
        }
        tracing::debug!(filter = %filter, "delivery task finished");
    })
}

// ═══════════════════════════════════════════════════════════════
//  MessageBus
// ═══════════════════════════════════════════════════════════════

struct BusInner {
    config: BusConfig,
    next_id: AtomicU64,
    subscribers: RwLock<BTreeMap<u64, Subscriber>>,
    descriptions: RwLock<HashMap<String, ServiceDescription>>,
}

impl BusInner {
    fn subscribers(&self) -> RwLockReadGuard<'_, BTreeMap<u64, Subscriber>> {
        match self.subscribers.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("subscriber table read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn subscribers_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<u64, Subscriber>> {
        match self.subscribers.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("subscriber table write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Cheap to clone; all clones share the same subscriber table.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                next_id: AtomicU64::new(1),
                subscribers: RwLock::new(BTreeMap::new()),
                descriptions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Publish a message to every matching subscription.
    ///
    /// Returns the number of subscriptions the message was queued for.
    pub async fn publish(&self, delivery: Delivery) -> usize {
        let targets: Vec<(u64, mpsc::Sender<Delivery>)> = self
            .inner
            .subscribers()
            .iter()
            .filter(|(_, sub)| sub.filter.matches(&delivery.entity_id))
            .map(|(id, sub)| (*id, sub.tx.clone()))
            .collect();

        let mut queued = 0;
        for (id, tx) in targets {
            let result = match self.inner.config.overflow {
                OverflowPolicy::Drop => match tx.try_send(delivery.clone()) {
                    Ok(()) => Ok(()),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(subscription = id, entity = %delivery.entity_id, "subscriber queue full, dropping");
                        continue;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => Err(()),
                },
                OverflowPolicy::BackPressure => tx.send(delivery.clone()).await.map_err(|_| ()),
            };
            match result {
                Ok(()) => queued += 1,
                Err(()) => {
                    tracing::debug!(subscription = id, "subscriber closed during publish");
                }
            }
        }
        queued
    }

    /// Number of live subscriptions across all connections.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscribers().len()
    }

    /// Last description published for `service_id`.
    pub fn description(&self, service_id: &str) -> Option<ServiceDescription> {
        let guard = match self.inner.descriptions.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.get(service_id).cloned()
    }

    /// Open a connection directly, without going through the trait object.
    pub fn open(&self, client_id: &str) -> BusConnection {
        let id = self.inner.next_id();
        tracing::info!(client = %client_id, connection = id, "bus connection opened");
        BusConnection {
            id,
            client_id: client_id.to_string(),
            inner: self.inner.clone(),
            connected: AtomicBool::new(true),
        }
    }

    async fn store_and_publish(&self, description: &ServiceDescription) -> Result<(), BusError> {
        let payload = description.to_json()?;
        {
            let mut guard = match self.inner.descriptions.write() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.insert(description.service_id.clone(), description.clone());
        }
        let delivery = Delivery::new(
            description.service_id.clone(),
            DESCRIPTION_MESSAGE_TYPE,
            payload,
            description.service_id.clone(),
        );
        self.publish(delivery).await;
        Ok(())
    }
}

impl SubscriptionSource for MessageBus {
    fn connect(&self, client_id: &str) -> BoxFuture<'_, Result<Box<dyn Connection>, ApiError>> {
        let conn = self.open(client_id);
        Box::pin(async move { Ok(Box::new(conn) as Box<dyn Connection>) })
    }
}

impl DescriptionPublisher for MessageBus {
    fn publish_description(
        &self,
        description: &ServiceDescription,
    ) -> BoxFuture<'_, Result<(), ApiError>> {
        let description = description.clone();
        Box::pin(async move {
            self.store_and_publish(&description)
                .await
                .map_err(BusError::into_api_error)
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  BusConnection
// ═══════════════════════════════════════════════════════════════

pub struct BusConnection {
    id: u64,
    client_id: String,
    inner: Arc<BusInner>,
    connected: AtomicBool,
}

impl BusConnection {
    fn ensure_connected(&self) -> Result<(), BusError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BusError::Disconnected(self.client_id.clone()))
        }
    }

    fn do_subscribe(
        &self,
        filter: TopicFilter,
        handler: MessageHandler,
    ) -> Result<SubscriptionToken, BusError> {
        self.ensure_connected()?;
        let (tx, rx) = mpsc::channel(self.inner.config.buffer.max(1));
        let cancel = CancellationToken::new();
        let task = spawn_delivery(filter.clone(), rx, handler, cancel.clone());
        let id = self.inner.next_id();
        tracing::info!(client = %self.client_id, subscription = id, filter = %filter, "subscribed");
        self.inner.subscribers_mut().insert(
            id,
            Subscriber {
                connection: self.id,
                filter,
                tx,
                cancel,
                task,
            },
        );
        Ok(SubscriptionToken(id))
    }

    async fn do_unsubscribe(&self, token: SubscriptionToken) -> Result<(), BusError> {
        let removed = {
            let mut subs = self.inner.subscribers_mut();
            match subs.get(&token.0) {
                Some(sub) if sub.connection == self.id => subs.remove(&token.0),
                _ => None,
            }
        };
        let sub = removed.ok_or(BusError::UnknownSubscription(token.0))?;
        tracing::info!(client = %self.client_id, subscription = token.0, filter = %sub.filter, "unsubscribed");
        sub.shutdown().await;
        Ok(())
    }

    async fn do_disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let orphans: Vec<Subscriber> = {
            let mut subs = self.inner.subscribers_mut();
            let ids: Vec<u64> = subs
                .iter()
                .filter(|(_, sub)| sub.connection == self.id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| subs.remove(&id)).collect()
        };
        if !orphans.is_empty() {
            tracing::warn!(client = %self.client_id, count = orphans.len(), "dropping subscriptions left open at disconnect");
        }
        for sub in orphans {
            sub.shutdown().await;
        }
        tracing::info!(client = %self.client_id, connection = self.id, "bus connection closed");
    }
}

impl Connection for BusConnection {
    fn subscribe(
        &self,
        filter: TopicFilter,
        handler: MessageHandler,
    ) -> BoxFuture<'_, Result<SubscriptionToken, ApiError>> {
        Box::pin(async move {
            self.do_subscribe(filter, handler)
                .map_err(BusError::into_api_error)
        })
    }

    fn unsubscribe(&self, token: SubscriptionToken) -> BoxFuture<'_, Result<(), ApiError>> {
        Box::pin(async move {
            self.do_unsubscribe(token)
                .await
                .map_err(BusError::into_api_error)
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.do_disconnect())
    }
}

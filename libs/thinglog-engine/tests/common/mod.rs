#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thinglog_api::{
    ApiError, BoxFuture, Connection, Delivery, LogRecord, MessageHandler, SubscriptionSource,
    SubscriptionToken, TopicFilter,
};
use thinglog_engine::{Durability, LoggerConfig};

/// Config recording into `folder` without fsync.
pub fn logger_config(folder: &Path, entities: &[&str]) -> LoggerConfig {
    LoggerConfig {
        logs_folder: folder.display().to_string(),
        entity_filter: entities.iter().map(|e| e.to_string()).collect(),
        durability: Durability::DevLoose,
        ..LoggerConfig::default()
    }
}

pub fn read_records(path: &Path) -> Vec<LogRecord> {
    match std::fs::read_to_string(path) {
        Ok(text) => text
            .lines()
            .map(|l| serde_json::from_str(l).expect("log line is a record"))
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Poll until `path` holds at least `n` records.
pub async fn wait_for_records(path: &Path, n: usize) -> Vec<LogRecord> {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let records = read_records(path);
            if records.len() >= n {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    match waited {
        Ok(records) => records,
        Err(_) => panic!(
            "expected {n} records in {}, found {}",
            path.display(),
            read_records(path).len()
        ),
    }
}

// ════════════════════════════════════════════════════════════════
//  ManualSource: synchronous in-test transport
// ════════════════════════════════════════════════════════════════

#[derive(Default)]
struct ManualState {
    active: BTreeMap<u64, (TopicFilter, MessageHandler)>,
    /// Every handler ever registered, including cancelled ones.
    history: Vec<MessageHandler>,
    subscribe_calls: usize,
    fail_subscribe_at: Option<usize>,
    connects: Vec<String>,
    disconnects: usize,
}

/// Transport double that delivers on the caller's thread.
#[derive(Clone, Default)]
pub struct ManualSource {
    state: Arc<Mutex<ManualState>>,
    next_token: Arc<AtomicU64>,
}

impl ManualSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `nth` subscribe call (0-based, counted across connections) fail.
    pub fn fail_subscribe_at(&self, nth: usize) {
        self.state.lock().unwrap().fail_subscribe_at = Some(nth);
    }

    /// Invoke every matching active handler. Returns how many ran.
    pub fn deliver(&self, delivery: Delivery) -> usize {
        let handlers: Vec<MessageHandler> = self
            .state
            .lock()
            .unwrap()
            .active
            .values()
            .filter(|(filter, _)| filter.matches(&delivery.entity_id))
            .map(|(_, h)| h.clone())
            .collect();
        for h in &handlers {
            h(delivery.clone());
        }
        handlers.len()
    }

    pub fn active_filters(&self) -> Vec<TopicFilter> {
        self.state.lock().unwrap().active.values().map(|(f, _)| f.clone()).collect()
    }

    /// A handler registered earlier, even if since unsubscribed.
    pub fn stale_handler(&self, index: usize) -> MessageHandler {
        self.state.lock().unwrap().history[index].clone()
    }

    pub fn connects(&self) -> Vec<String> {
        self.state.lock().unwrap().connects.clone()
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().unwrap().disconnects
    }
}

impl SubscriptionSource for ManualSource {
    fn connect(&self, client_id: &str) -> BoxFuture<'_, Result<Box<dyn Connection>, ApiError>> {
        let client_id = client_id.to_string();
        Box::pin(async move {
            self.state.lock().unwrap().connects.push(client_id);
            let conn: Box<dyn Connection> = Box::new(ManualConnection { source: self.clone() });
            Ok(conn)
        })
    }
}

struct ManualConnection {
    source: ManualSource,
}

impl Connection for ManualConnection {
    fn subscribe(
        &self,
        filter: TopicFilter,
        handler: MessageHandler,
    ) -> BoxFuture<'_, Result<SubscriptionToken, ApiError>> {
        Box::pin(async move {
            let mut state = self.source.state.lock().unwrap();
            let call = state.subscribe_calls;
            state.subscribe_calls += 1;
            if state.fail_subscribe_at == Some(call) {
                return Err(ApiError::new(format!("subscribe to '{filter}' refused")));
            }
            let id = self.source.next_token.fetch_add(1, Ordering::Relaxed);
            state.history.push(handler.clone());
            state.active.insert(id, (filter, handler));
            Ok(SubscriptionToken(id))
        })
    }

    fn unsubscribe(&self, token: SubscriptionToken) -> BoxFuture<'_, Result<(), ApiError>> {
        Box::pin(async move {
            match self.source.state.lock().unwrap().active.remove(&token.0) {
                Some(_) => Ok(()),
                None => Err(ApiError::new(format!("unknown subscription {}", token.0))),
            }
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.source.state.lock().unwrap().disconnects += 1;
        })
    }
}

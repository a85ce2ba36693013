use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use thinglog_api::{
    Connection, Delivery, DescriptionPublisher, LogRecord, MessageHandler, SubscriptionSource,
    SubscriptionToken, TopicFilter,
};

use crate::config::{HostPaths, LoggerConfig, RoutingConfig};
use crate::describe::describe_service;
use crate::error::{RouterError, SinkError};
use crate::sink::FileSink;

// ════════════════════════════════════════════════════════════════
//  State
// ════════════════════════════════════════════════════════════════

/// Lifecycle of a [`LogRouter`].
///
/// `Stopped → Starting → Running → Stopping → Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RouterState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl RouterState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RouterState::Starting,
            2 => RouterState::Running,
            3 => RouterState::Stopping,
            _ => RouterState::Stopped,
        }
    }

    /// Whether callbacks may still hand messages to the sink.
    pub fn accepts_messages(self) -> bool {
        matches!(self, RouterState::Starting | RouterState::Running)
    }
}

impl std::fmt::Display for RouterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterState::Stopped => f.write_str("stopped"),
            RouterState::Starting => f.write_str("starting"),
            RouterState::Running => f.write_str("running"),
            RouterState::Stopping => f.write_str("stopping"),
        }
    }
}

/// State shared between the router and its subscription callbacks.
#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(RouterState::Stopped as u8))
    }

    fn load(&self) -> RouterState {
        RouterState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: RouterState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

// ════════════════════════════════════════════════════════════════
//  Recorder
// ════════════════════════════════════════════════════════════════

/// Turns deliveries into records for one session's sink.
struct Recorder {
    state: Arc<StateCell>,
    sink: FileSink,
}

impl Recorder {
    fn record(&self, delivery: Delivery) {
        tracing::debug!(
            entity = %delivery.entity_id,
            msg_type = %delivery.message_type,
            sender = %delivery.sender,
            "received message"
        );

        let state = self.state.load();
        if !state.accepts_messages() {
            tracing::warn!(entity = %delivery.entity_id, %state, "message received after stop, discarding");
            return;
        }

        let record = LogRecord::from_delivery(&delivery);
        if record.is_unparsed() {
            tracing::debug!(entity = %delivery.entity_id, "payload is not JSON, recording raw bytes only");
        }

        match self.sink.write(&delivery.entity_id, &record) {
            Ok(()) => {}
            Err(SinkError::Closed) => {
                tracing::warn!(entity = %delivery.entity_id, "log files already closed, discarding message");
            }
            Err(e) => {
                tracing::warn!(entity = %delivery.entity_id, error = %e, "dropping message");
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════
//  LogRouter
// ════════════════════════════════════════════════════════════════

/// Everything created by one successful `start`.
struct Session {
    routing: RoutingConfig,
    connection: Box<dyn Connection>,
    subscriptions: Vec<(TopicFilter, SubscriptionToken)>,
    recorder: Arc<Recorder>,
}

/// Records bus messages into one log file per entity.
pub struct LogRouter {
    source: Arc<dyn SubscriptionSource>,
    describer: Option<Arc<dyn DescriptionPublisher>>,
    host: HostPaths,
    state: Arc<StateCell>,
    /// Serializes start/stop; `Some` while running.
    session: tokio::sync::Mutex<Option<Session>>,
}

impl std::fmt::Debug for LogRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogRouter")
            .field("state", &self.state())
            .field("host", &self.host)
            .finish()
    }
}

impl LogRouter {
    pub fn new(source: Arc<dyn SubscriptionSource>, host: HostPaths) -> Self {
        Self {
            source,
            describer: None,
            host,
            state: Arc::new(StateCell::new()),
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Collaborator used when `publish_description` is enabled. Without
    /// one, self-description is skipped.
    pub fn with_describer(mut self, describer: Arc<dyn DescriptionPublisher>) -> Self {
        self.describer = Some(describer);
        self
    }

    pub fn state(&self) -> RouterState {
        self.state.load()
    }

    /// Resolved logs folder of the running session.
    pub async fn logs_folder(&self) -> Option<PathBuf> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.routing.logs_folder.clone())
    }

    /// Filters of the active subscriptions.
    pub async fn subscriptions(&self) -> Vec<TopicFilter> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.subscriptions.iter().map(|(f, _)| f.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of log files currently held open.
    pub async fn open_files(&self) -> usize {
        self.session
            .lock()
            .await
            .as_ref()
            .map_or(0, |s| s.recorder.sink.open_files())
    }

    /// Connect, subscribe and start recording.
    ///
    /// Fails with [`RouterError::AlreadyStarted`] unless stopped; the
    /// running session is left untouched in that case. Any other failure
    /// leaves the router stopped with no subscription open.
    pub async fn start(&self, config: &LoggerConfig) -> Result<(), RouterError> {
        let mut slot = self.session.lock().await;
        let current = self.state.load();
        if current != RouterState::Stopped || slot.is_some() {
            return Err(RouterError::AlreadyStarted(current));
        }

        self.state.store(RouterState::Starting);
        match self.open_session(config).await {
            Ok(session) => {
                tracing::info!(
                    client = %session.routing.client_id,
                    folder = %session.routing.logs_folder.display(),
                    subscriptions = session.subscriptions.len(),
                    "log router started"
                );
                *slot = Some(session);
                self.state.store(RouterState::Running);
                Ok(())
            }
            Err(e) => {
                self.state.store(RouterState::Stopped);
                Err(e)
            }
        }
    }

    async fn open_session(&self, config: &LoggerConfig) -> Result<Session, RouterError> {
        let routing = config.resolve(&self.host);
        routing.verify_logs_folder()?;

        let connection = self
            .source
            .connect(&routing.client_id)
            .await
            .map_err(|source| RouterError::Transport(source.with_context("connect")))?;

        let recorder = Arc::new(Recorder {
            state: self.state.clone(),
            sink: FileSink::new(&routing.logs_folder, routing.durability),
        });

        let mut subscriptions = Vec::new();
        for filter in routing.filters() {
            let callback = recorder.clone();
            let handler: MessageHandler = Arc::new(move |delivery: Delivery| callback.record(delivery));
            match connection.subscribe(filter.clone(), handler).await {
                Ok(token) => {
                    tracing::info!(filter = %filter, "subscribed");
                    subscriptions.push((filter, token));
                }
                Err(source) => {
                    tracing::error!(filter = %filter, kind = %source.kind(), error = %source, "subscribe failed, rolling back");
                    cancel_subscriptions(&*connection, &subscriptions).await;
                    connection.disconnect().await;
                    recorder.sink.close_all();
                    return Err(RouterError::Transport(
                        source.with_context(format!("subscribe '{filter}'")),
                    ));
                }
            }
        }

        if routing.self_describe {
            self.publish_description(&routing).await;
        }

        Ok(Session {
            routing,
            connection,
            subscriptions,
            recorder,
        })
    }

    async fn publish_description(&self, routing: &RoutingConfig) {
        let Some(describer) = &self.describer else {
            tracing::debug!("no description publisher, skipping self-description");
            return;
        };
        let description = describe_service(routing);
        tracing::info!(service = %description.service_id, "publishing service description");
        if let Err(e) = describer.publish_description(&description).await {
            tracing::warn!(service = %description.service_id, error = %e, "failed to publish service description");
        }
    }

    /// Unsubscribe, close all log files and disconnect. No-op when stopped.
    ///
    /// Callbacks still running observe `Stopping` and discard their message.
    pub async fn stop(&self) {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.take() else {
            tracing::debug!("stop requested while already stopped");
            return;
        };

        tracing::info!(client = %session.routing.client_id, "stopping log router");
        self.state.store(RouterState::Stopping);

        cancel_subscriptions(&*session.connection, &session.subscriptions).await;
        let closed = session.recorder.sink.close_all();
        session.connection.disconnect().await;

        self.state.store(RouterState::Stopped);
        tracing::info!(files = closed, "log router stopped");
    }
}

async fn cancel_subscriptions(
    connection: &dyn Connection,
    subscriptions: &[(TopicFilter, SubscriptionToken)],
) {
    for (filter, token) in subscriptions {
        if let Err(e) = connection.unsubscribe(*token).await {
            tracing::warn!(filter = %filter, kind = %e.kind(), error = %e, "unsubscribe failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_cell() {
        let cell = StateCell::new();
        assert_eq!(cell.load(), RouterState::Stopped);
        for state in [
            RouterState::Starting,
            RouterState::Running,
            RouterState::Stopping,
            RouterState::Stopped,
        ] {
            cell.store(state);
            assert_eq!(cell.load(), state);
        }
    }

    #[test]
    fn only_live_states_accept_messages() {
        assert!(RouterState::Starting.accepts_messages());
        assert!(RouterState::Running.accepts_messages());
        assert!(!RouterState::Stopping.accepts_messages());
        assert!(!RouterState::Stopped.accepts_messages());
    }

    #[test]
    fn recorder_discards_after_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let state = Arc::new(StateCell::new());
        let recorder = Recorder {
            state: state.clone(),
            sink: FileSink::new(tmp.path(), crate::config::Durability::DevLoose),
        };

        state.store(RouterState::Running);
        recorder.record(Delivery::new("thing1", "event", "{}", ""));
        assert_eq!(recorder.sink.open_files(), 1);

        state.store(RouterState::Stopping);
        recorder.record(Delivery::new("thing2", "event", "{}", ""));
        assert!(!tmp.path().join("thing2.log").exists());
    }
}

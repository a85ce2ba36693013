use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::describe::ServiceDescription;
use crate::error::ApiError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ════════════════════════════════════════════════════════════════
//  Messages
// ════════════════════════════════════════════════════════════════

/// One message as delivered by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// The entity ("thing") the message is about.
    pub entity_id: String,
    pub message_type: String,
    pub payload: Vec<u8>,
    /// Client id of the publisher, empty when unknown.
    pub sender: String,
}

impl Delivery {
    pub fn new(
        entity_id: impl Into<String>,
        message_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            message_type: message_type.into(),
            payload: payload.into(),
            sender: sender.into(),
        }
    }
}

/// Which entities a subscription receives.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TopicFilter {
    /// Every entity.
    All,
    /// Exactly one entity id.
    Entity(String),
}

impl TopicFilter {
    pub fn matches(&self, entity_id: &str) -> bool {
        match self {
            TopicFilter::All => true,
            TopicFilter::Entity(id) => id == entity_id,
        }
    }
}

impl std::fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopicFilter::All => f.write_str("*"),
            TopicFilter::Entity(id) => f.write_str(id),
        }
    }
}

/// Opaque handle returned by [`Connection::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(pub u64);

/// Subscription callback.
///
/// May be invoked concurrently from transport worker threads, also while
/// the subscriber is shutting down. Must not panic and must not block
/// for long.
pub type MessageHandler = Arc<dyn Fn(Delivery) + Send + Sync>;

// ════════════════════════════════════════════════════════════════
//  Collaborator traits
// ════════════════════════════════════════════════════════════════

/// Factory for transport connections (the pub/sub client side).
pub trait SubscriptionSource: Send + Sync {
    /// Open a connection identified by `client_id`.
    fn connect(&self, client_id: &str) -> BoxFuture<'_, Result<Box<dyn Connection>, ApiError>>;
}

/// A live transport connection.
///
/// Callbacks registered through `subscribe` are invoked between the
/// call and the completion of the matching `unsubscribe`.
pub trait Connection: Send + Sync {
    fn subscribe(
        &self,
        filter: TopicFilter,
        handler: MessageHandler,
    ) -> BoxFuture<'_, Result<SubscriptionToken, ApiError>>;

    /// Cancel a subscription. Once this resolves the handler is no longer
    /// running and will not be invoked again.
    fn unsubscribe(&self, token: SubscriptionToken) -> BoxFuture<'_, Result<(), ApiError>>;

    /// Close the connection, dropping any subscriptions still open.
    fn disconnect(&self) -> BoxFuture<'_, ()>;
}

/// Optional side channel used to announce the recorder itself.
/// Fire-and-forget: the caller only logs failures.
pub trait DescriptionPublisher: Send + Sync {
    fn publish_description(
        &self,
        description: &ServiceDescription,
    ) -> BoxFuture<'_, Result<(), ApiError>>;
}

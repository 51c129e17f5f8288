//! The message broker seam.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::auth::Credential;
use crate::error::TransportError;

/// Delivery guarantee requested for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// A message on its way to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: Qos) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
        }
    }
}

/// Events raised by the broker client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    ConnectionLost { reason: String },
    MessageArrived { topic: String, payload: Vec<u8> },
}

/// A publish/subscribe broker client.
///
/// Implementations report connection loss and inbound messages through
/// [`Broker::events`]. Reconnecting is the caller's job.
pub trait Broker: Send + Sync + 'static {
    fn connect<'a>(
        &'a self,
        client_id: &'a str,
        credential: &'a Credential,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    fn disconnect(&self) -> BoxFuture<'_, ()>;

    fn publish(&self, message: OutboundMessage) -> BoxFuture<'_, Result<(), TransportError>>;

    fn subscribe<'a>(&'a self, topic: &'a str, qos: Qos)
        -> BoxFuture<'a, Result<(), TransportError>>;

    fn unsubscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<(), TransportError>>;

    fn events(&self) -> broadcast::Receiver<BrokerEvent>;
}

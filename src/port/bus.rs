use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::domain::{
    address::Address,
    error::DispatchError,
    message::{Message, MessageProperties}
};

/// Opaque handle of one receiver subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Options used when opening a broker connection
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Reconnect transparently after transport failures
    pub reconnect:     bool,
    /// Upper bound on how long `close` may block
    pub close_timeout: Duration
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self { reconnect: true, close_timeout: Duration::from_secs(5) }
    }
}

/// Options for one receiver subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverOptions {
    /// Maximum number of unacknowledged deliveries held by the subscription
    pub capacity:  usize,
    /// Create the destination on demand and delete it once its sole receiver leaves
    pub ephemeral: bool
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self { capacity: 1, ephemeral: false }
    }
}

impl ReceiverOptions {
    pub fn ephemeral() -> Self {
        Self { capacity: 1, ephemeral: true }
    }
}

/// Raw message as it travels through the broker
#[derive(Debug, Clone)]
pub struct Envelope {
    pub body:       Vec<u8>,
    pub properties: MessageProperties
}

impl Envelope {
    pub fn from_message(message: &Message) -> Result<Self, DispatchError> {
        Ok(Self { body: message.encode()?, properties: message.properties.clone() })
    }
}

/// A fetched but not yet acknowledged message
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag:          u64,
    pub subscription: SubscriptionId,
    pub address:      Address,
    pub envelope:     Envelope
}

impl Delivery {
    /// Decode the envelope; a malformed body yields `Serialization`
    pub fn message(&self) -> Result<Message, DispatchError> {
        Message::decode(&self.envelope.body, self.envelope.properties.clone())
    }
}

/// Connection to a publish/subscribe broker
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// Make sure a named destination exists
    async fn declare(&self, address: &Address) -> Result<(), DispatchError>;

    async fn send(&self, address: &Address, envelope: Envelope) -> Result<(), DispatchError>;

    async fn subscribe(&self, address: &Address, options: &ReceiverOptions) -> Result<SubscriptionId, DispatchError>;

    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), DispatchError>;

    /// Next available message across all given subscriptions, or `None` on timeout
    async fn next_message(
        &self,
        subscriptions: &[SubscriptionId],
        timeout: Duration
    ) -> Result<Option<Delivery>, DispatchError>;

    /// Consume a delivery for good
    async fn acknowledge(&self, delivery: &Delivery) -> Result<(), DispatchError>;

    /// Hand a delivery back to the head of its queue
    async fn release(&self, delivery: &Delivery) -> Result<(), DispatchError>;

    /// Refuse a delivery; the broker routes it to the deadletter destination
    async fn reject(&self, delivery: &Delivery) -> Result<(), DispatchError>;

    async fn close(&self) -> Result<(), DispatchError>;

    fn is_open(&self) -> bool;
}

/// Factory for broker connections
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn BusConnection>, DispatchError>;
}

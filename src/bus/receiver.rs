//! Receiver watching one or more destinations
//!
//! Fetching and acknowledging are separate steps: a caller can inspect a
//! delivery and then decide to acknowledge, release or reject it.

use std::time::Duration;

use tracing::{Level, event};

use crate::{
    bus::session::BusSession,
    domain::{address::Address, constant::bus, error::DispatchError},
    port::bus::{Delivery, ReceiverOptions, SubscriptionId}
};

pub struct FromBus {
    session:       BusSession,
    options:       ReceiverOptions,
    subscriptions: Vec<(Address, SubscriptionId)>
}

impl FromBus {
    pub(crate) fn new(session: BusSession, options: ReceiverOptions) -> Result<Self, DispatchError> {
        if options.capacity < 1 {
            return Err(DispatchError::Validation("receiver capacity must be at least 1".to_string()));
        }
        Ok(Self { session, options, subscriptions: Vec::new() })
    }

    pub fn destinations(&self) -> impl Iterator<Item = &Address> {
        self.subscriptions.iter().map(|(address, _)| address)
    }

    pub async fn add_destination(&mut self, address: Address) -> Result<(), DispatchError> {
        if self.subscriptions.iter().any(|(watched, _)| *watched == address) {
            return Ok(());
        }
        let id = self.session.connection().subscribe(&address, &self.options).await?;
        self.subscriptions.push((address, id));
        Ok(())
    }

    pub async fn remove_destination(&mut self, address: &Address) -> Result<(), DispatchError> {
        if let Some(index) = self.subscriptions.iter().position(|(watched, _)| watched == address) {
            let (_, id) = self.subscriptions.remove(index);
            self.session.connection().unsubscribe(id).await?;
        }
        Ok(())
    }

    /// Next message available on any watched destination, `None` on timeout
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>, DispatchError> {
        let ids: Vec<SubscriptionId> = self.subscriptions.iter().map(|(_, id)| *id).collect();
        let delivery = self.session.connection().next_message(&ids, timeout).await?;

        if let Some(delivery) = &delivery {
            event!(Level::DEBUG, event = bus::MESSAGE_RECEIVED, address = %delivery.address, tag = delivery.tag);
        }
        Ok(delivery)
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<(), DispatchError> {
        self.session.connection().acknowledge(delivery).await
    }

    /// Put the delivery back so it is received again
    pub async fn release(&self, delivery: &Delivery) -> Result<(), DispatchError> {
        self.session.connection().release(delivery).await
    }

    pub async fn reject(&self, delivery: &Delivery) -> Result<(), DispatchError> {
        self.session.connection().reject(delivery).await
    }

    /// Drop every subscription; ephemeral destinations disappear with it
    pub async fn close(&mut self) -> Result<(), DispatchError> {
        let mut result = Ok(());
        for (_, id) in self.subscriptions.drain(..) {
            if let Err(e) = self.session.connection().unsubscribe(id).await {
                result = Err(e);
            }
        }
        result
    }
}

impl Drop for FromBus {
    fn drop(&mut self) {
        if self.subscriptions.is_empty() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let connection = self.session.connection().clone();
            let ids: Vec<SubscriptionId> = self.subscriptions.drain(..).map(|(_, id)| id).collect();
            handle.spawn(async move {
                for id in ids {
                    let _ = connection.unsubscribe(id).await;
                }
            });
        }
    }
}

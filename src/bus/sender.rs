use tracing::{Level, event};

use crate::{
    bus::session::BusSession,
    domain::{address::Address, constant::bus, error::DispatchError, message::Message},
    port::bus::Envelope
};

/// Sender bound to one destination
#[derive(Clone)]
pub struct ToBus {
    session: BusSession,
    address: Address
}

impl ToBus {
    pub(crate) fn new(session: BusSession, address: Address) -> Self {
        Self { session, address }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub async fn send(&self, message: &Message) -> Result<(), DispatchError> {
        let envelope = Envelope::from_message(message)?;
        self.session.connection().send(&self.address, envelope).await?;

        event!(Level::DEBUG, event = bus::MESSAGE_SENT,
               address = %self.address, kind = %message.kind(), message_id = %message.id());
        Ok(())
    }
}

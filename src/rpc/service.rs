//! Service side of request/reply
//!
//! A service watches one destination, hands each request payload to its
//! handler and answers on the request's `reply_to` address:
//! - `OK` with the handler's content
//! - `ERROR` with `{state, errmsg, backtrace}` where `errmsg` is `<Name>: <message>`
//! - `INVALID_MESSAGE` when the request could not be decoded

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

use crate::{
    bus::{BusSession, FromBus},
    domain::{
        address::Address,
        constant::rpc,
        error::DispatchError,
        message::{Message, MessageKind, STATUS_ERROR, STATUS_INVALID_MESSAGE, STATUS_OK},
        payload::Payload
    },
    port::bus::{Delivery, ReceiverOptions}
};

/// Failure reported back to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcFault {
    pub name:      String,
    pub message:   String,
    pub backtrace: String
}

impl RpcFault {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self { name: name.into(), message: message.into(), backtrace: String::new() }
    }

    pub fn with_backtrace(mut self, backtrace: impl Into<String>) -> Self {
        self.backtrace = backtrace.into();
        self
    }

    fn into_payload(self, state: &str) -> Payload {
        Payload::map([
            ("state", Payload::str(state)),
            ("errmsg", Payload::str(format!("{}: {}", self.name, self.message))),
            ("backtrace", Payload::str(self.backtrace))
        ])
    }
}

impl From<DispatchError> for RpcFault {
    fn from(err: DispatchError) -> Self {
        RpcFault::new("DispatchError", err.to_string())
    }
}

#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, request: Option<Payload>) -> Result<Option<Payload>, RpcFault>;
}

#[async_trait]
impl<F, Fut> RpcHandler for F
where
    F: Fn(Option<Payload>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Payload>, RpcFault>> + Send + 'static
{
    async fn handle(&self, request: Option<Payload>) -> Result<Option<Payload>, RpcFault> {
        (self)(request).await
    }
}

pub struct RpcService {
    session: BusSession,
    address: Address,
    handler: Arc<dyn RpcHandler>
}

impl RpcService {
    pub fn new(session: BusSession, address: Address, handler: Arc<dyn RpcHandler>) -> Self {
        Self { session, address, handler }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Serve requests until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<(), DispatchError> {
        let mut receiver = self.session.receiver(&[self.address.clone()], ReceiverOptions::default()).await?;
        event!(Level::INFO, event = rpc::SERVICE_STARTED, address = %self.address);

        let result = loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                delivery = receiver.receive(Duration::from_millis(250)) => delivery
            };
            match delivery {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.serve(&receiver, delivery).await {
                        event!(Level::WARN, event = rpc::REQUEST_INVALID, address = %self.address, error = %e);
                    }
                }
                Ok(None) => {}
                Err(e) => break Err(e)
            }
        };

        let _ = receiver.close().await;
        event!(Level::INFO, event = rpc::SERVICE_STOPPED, address = %self.address);
        result
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<Result<(), DispatchError>> {
        tokio::spawn(self.run(cancel))
    }

    async fn serve(&self, receiver: &FromBus, delivery: Delivery) -> Result<(), DispatchError> {
        let reply_to = delivery.envelope.properties.reply_to.clone();
        let reply = match delivery.message() {
            Ok(request) if request.kind() == MessageKind::RequestMessage => self.answer(request).await,
            Ok(other) => invalid(format!("expected a request, got {}", other.kind())),
            Err(e) => invalid(e.to_string())
        };

        let sent = match reply_to.as_deref().map(str::parse::<Address>) {
            Some(Ok(address)) => self.session.sender(address).send(&reply).await,
            Some(Err(e)) => Err(e),
            None => Err(DispatchError::Rpc("request has no reply_to".to_string()))
        };
        receiver.ack(&delivery).await?;
        sent
    }

    async fn answer(&self, request: Message) -> Message {
        let summary = request.summary().to_string();
        match self.handler.handle(request.payload).await {
            Ok(content) => {
                event!(Level::DEBUG, event = rpc::REQUEST_HANDLED, service = %summary, status = STATUS_OK);
                Message::reply(STATUS_OK, content)
            }
            Err(fault) => {
                event!(Level::WARN, event = rpc::REQUEST_HANDLED,
                       service = %summary, status = STATUS_ERROR, error = %fault.name, message = %fault.message);
                Message::reply(STATUS_ERROR, Some(fault.into_payload(STATUS_ERROR)))
            }
        }
    }
}

fn invalid(reason: String) -> Message {
    event!(Level::WARN, event = rpc::REQUEST_INVALID, reason = %reason);
    let fault = RpcFault::new("InvalidMessage", reason);
    Message::reply(STATUS_INVALID_MESSAGE, Some(fault.into_payload(STATUS_INVALID_MESSAGE)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{adapter::memory_bus::InMemoryBroker, port::bus::ConnectionOptions};

    #[tokio::test]
    async fn test_malformed_request_gets_invalid_message_reply() {
        let broker = InMemoryBroker::new("ops");
        let session = BusSession::open(&broker, ConnectionOptions::default()).await.unwrap();
        let service_address = Address::new("ops", "echo");
        let handler: Arc<dyn RpcHandler> = Arc::new(|request: Option<Payload>| async move { Ok::<_, RpcFault>(request) });
        let cancel = CancellationToken::new();
        let task = RpcService::new(session.clone(), service_address.clone(), handler).spawn(cancel.clone());

        let reply_to = Address::reply();
        let replies = session.receiver(&[reply_to.clone()], ReceiverOptions::ephemeral()).await.unwrap();
        let mut envelope = crate::port::bus::Envelope::from_message(&Message::event(Payload::Null)).unwrap();
        envelope.body = b"{garbage".to_vec();
        envelope.properties.reply_to = Some(reply_to.to_string());
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.connection().send(&service_address, envelope).await.unwrap();

        let delivery = replies.receive(Duration::from_secs(5)).await.unwrap().unwrap();
        let reply = delivery.message().unwrap();
        assert_eq!(reply.status(), Some(STATUS_INVALID_MESSAGE));
        assert!(reply.payload.unwrap().get("errmsg").unwrap().as_str().unwrap().starts_with("InvalidMessage: "));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}

//! Client side of request/reply
//!
//! Every call gets its own `reply.<uuid>` destination, created on demand and
//! deleted when the call's receiver closes, so concurrent calls never see each
//! other's replies.

use std::{sync::Arc, time::Duration};

use tracing::{Level, event};

use crate::{
    bus::{BusSession, FromBus},
    config::RpcConfig,
    domain::{
        address::Address,
        constant::rpc,
        error::DispatchError,
        message::{Message, MessageKind, STATUS_OK},
        payload::Payload
    },
    port::bus::ReceiverOptions,
    rpc::{args::CallArgs, exception::ExceptionRegistry}
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcOptions {
    pub timeout:            Duration,
    /// Rehydrate remote errors into registered local error types
    pub forward_exceptions: bool
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(30), forward_exceptions: false }
    }
}

#[derive(Clone)]
pub struct RpcClient {
    session:    BusSession,
    bus:        String,
    options:    RpcOptions,
    exceptions: Arc<ExceptionRegistry>
}

impl RpcClient {
    pub fn new(session: BusSession, bus: impl Into<String>, options: RpcOptions) -> Self {
        Self { session, bus: bus.into(), options, exceptions: Arc::new(ExceptionRegistry::new()) }
    }

    /// Client with the timeout and exception forwarding of the `rpc` section
    pub fn from_config(session: BusSession, bus: impl Into<String>, config: &RpcConfig) -> Self {
        Self::new(session, bus, config.options())
    }

    pub fn with_exceptions(mut self, exceptions: ExceptionRegistry) -> Self {
        self.exceptions = Arc::new(exceptions);
        self
    }

    pub fn options(&self) -> &RpcOptions {
        &self.options
    }

    /// Call `service` with the client's default options
    pub async fn call(&self, service: &str, args: CallArgs) -> Result<(Payload, String), DispatchError> {
        self.call_with(service, args, &self.options).await
    }

    /// Call `service` and wait at most `options.timeout` for its reply
    pub async fn call_with(
        &self,
        service: &str,
        args: CallArgs,
        options: &RpcOptions
    ) -> Result<(Payload, String), DispatchError> {
        let reply_to = Address::reply();
        let mut receiver = self.session.receiver(&[reply_to.clone()], ReceiverOptions::ephemeral()).await?;

        let result = self.exchange(&receiver, &reply_to, service, args, options).await;
        let closed = receiver.close().await;

        match &result {
            Ok(_) => event!(Level::DEBUG, event = rpc::CALL_SUCCEEDED, service = %service),
            Err(e) if e.is_timeout() => {
                event!(Level::WARN, event = rpc::CALL_TIMEOUT, service = %service, timeout = ?options.timeout)
            }
            Err(e) => event!(Level::WARN, event = rpc::CALL_FAILED, service = %service, error = %e)
        }
        let value = result?;
        closed?;
        Ok(value)
    }

    async fn exchange(
        &self,
        receiver: &FromBus,
        reply_to: &Address,
        service: &str,
        args: CallArgs,
        options: &RpcOptions
    ) -> Result<(Payload, String), DispatchError> {
        let mut request = Message::request(service, args.pack());
        request.set_reply_to(reply_to.to_string());
        request.set_ttl(options.timeout);

        event!(Level::DEBUG, event = rpc::CALL_STARTED, service = %service, reply_to = %reply_to, message_id = %request.id());
        self.session.sender(Address::new(self.bus.as_str(), service)).send(&request).await?;

        let Some(delivery) = receiver.receive(options.timeout).await? else {
            return Err(DispatchError::timeout(format!("reply from {}", service), options.timeout));
        };
        receiver.ack(&delivery).await?;

        let reply = delivery
            .message()
            .map_err(|e| DispatchError::InvalidReply(format!("reply from {} could not be decoded: {}", service, e)))?;
        if reply.kind() != MessageKind::ReplyMessage {
            return Err(DispatchError::InvalidReply(format!("{} answered with a {}", service, reply.kind())));
        }

        let status = reply.status().unwrap_or_default().to_string();
        if status == STATUS_OK {
            return Ok((reply.payload.unwrap_or_default(), status));
        }
        Err(self.remote_failure(status, reply.payload, options))
    }

    fn remote_failure(&self, status: String, content: Option<Payload>, options: &RpcOptions) -> DispatchError {
        let text = |key: &str| {
            content.as_ref().and_then(|content| content.get(key)).and_then(Payload::as_str).map(str::to_string)
        };
        let state = text("state").unwrap_or_else(|| status.clone());
        let errmsg = text("errmsg").unwrap_or_else(|| format!("service replied with status {}", status));
        let backtrace = text("backtrace").unwrap_or_default();

        if !options.forward_exceptions {
            return DispatchError::RemoteFailure { state, errmsg, backtrace };
        }

        let name = errmsg.split_once(':').map(|(name, _)| name.trim()).unwrap_or(errmsg.as_str());
        match self.exceptions.build(name, backtrace) {
            Some(error) => DispatchError::Forwarded { name: name.to_string(), error },
            None => DispatchError::Rpc(errmsg)
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        adapter::memory_bus::InMemoryBroker,
        port::bus::ConnectionOptions,
        rpc::service::{RpcFault, RpcHandler, RpcService}
    };

    async fn setup() -> (InMemoryBroker, BusSession) {
        let broker = InMemoryBroker::new("ops");
        let session = BusSession::open(&broker, ConnectionOptions::default()).await.unwrap();
        (broker, session)
    }

    fn serve(session: &BusSession, name: &str, handler: Arc<dyn RpcHandler>) -> CancellationToken {
        let cancel = CancellationToken::new();
        RpcService::new(session.clone(), Address::new("ops", name), handler).spawn(cancel.clone());
        cancel
    }

    fn short(forward_exceptions: bool) -> RpcOptions {
        RpcOptions { timeout: Duration::from_secs(5), forward_exceptions }
    }

    #[tokio::test]
    async fn test_call_returns_content_and_status() {
        let (broker, session) = setup().await;
        let cancel = serve(
            &session,
            "echo",
            Arc::new(|request: Option<Payload>| async move { Ok::<_, RpcFault>(request) })
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = RpcClient::new(session.clone(), "ops", short(false));
        let (content, status) = client.call("echo", CallArgs::new().arg(5).kwarg("x", 1)).await.unwrap();
        assert_eq!(status, STATUS_OK);
        assert_eq!(content, Payload::list([Payload::Int(5), Payload::map([("x", Payload::Int(1))])]));

        let (content, _) = client.call("echo", CallArgs::new()).await.unwrap();
        assert!(content.is_null());
        assert_eq!(broker.subscription_count(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_concurrent_calls_get_their_own_replies() {
        let (broker, session) = setup().await;
        let cancel = serve(
            &session,
            "echo",
            Arc::new(|request: Option<Payload>| async move { Ok::<_, RpcFault>(request) })
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut config = RpcConfig::default();
        config.timeout_ms = 5_000;
        let client = RpcClient::from_config(session.clone(), "ops", &config);
        let calls: Vec<_> = (0..8_i64)
            .map(|n| {
                let client = client.clone();
                tokio::spawn(async move { (n, client.call("echo", CallArgs::new().arg(n)).await) })
            })
            .collect();

        for call in calls {
            let (n, result) = call.await.unwrap();
            let (content, status) = result.unwrap();
            assert_eq!(status, STATUS_OK);
            assert_eq!(content, Payload::Int(n));
        }
        assert_eq!(broker.subscription_count(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_silent_service_times_out() {
        let (broker, session) = setup().await;
        let client = RpcClient::new(session, "ops", RpcOptions::default());
        let options = RpcOptions { timeout: Duration::from_millis(200), forward_exceptions: false };

        let started = tokio::time::Instant::now();
        let err = client.call_with("nobody", CallArgs::new(), &options).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(200) + Duration::from_secs(1));
        assert_eq!(broker.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_non_reply_message_is_invalid_reply() {
        let (_broker, session) = setup().await;
        let responder = session.clone();
        let requests = session.receiver(&[Address::new("ops", "odd")], ReceiverOptions::default()).await.unwrap();
        tokio::spawn(async move {
            let delivery = requests.receive(Duration::from_secs(5)).await.unwrap().unwrap();
            let reply_to: Address = delivery.envelope.properties.reply_to.clone().unwrap().parse().unwrap();
            responder.sender(reply_to).send(&Message::event(Payload::Int(1))).await.unwrap();
            requests.ack(&delivery).await.unwrap();
        });

        let client = RpcClient::new(session, "ops", short(false));
        let err = client.call("odd", CallArgs::new()).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidReply(_)));
    }

    fn failing() -> Arc<dyn RpcHandler> {
        Arc::new(|_request: Option<Payload>| async move {
            Err::<Option<Payload>, _>(RpcFault::new("RangeError", "subband 999").with_backtrace("at estimate()"))
        })
    }

    #[derive(Debug, thiserror::Error)]
    #[error("range error: {0}")]
    struct RangeError(String);

    #[tokio::test]
    async fn test_remote_error_is_decomposed() {
        let (_broker, session) = setup().await;
        let cancel = serve(&session, "estimate", failing());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = RpcClient::new(session, "ops", short(false));
        match client.call("estimate", CallArgs::new().arg(999)).await.unwrap_err() {
            DispatchError::RemoteFailure { state, errmsg, backtrace } => {
                assert_eq!(state, "ERROR");
                assert_eq!(errmsg, "RangeError: subband 999");
                assert_eq!(backtrace, "at estimate()");
            }
            other => panic!("unexpected error: {}", other)
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_forwarded_exceptions() {
        let (_broker, session) = setup().await;
        let cancel = serve(&session, "estimate", failing());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut exceptions = ExceptionRegistry::new();
        exceptions.register("RangeError", RangeError);
        let client = RpcClient::new(session.clone(), "ops", short(true)).with_exceptions(exceptions);
        match client.call("estimate", CallArgs::new()).await.unwrap_err() {
            DispatchError::Forwarded { name, error } => {
                assert_eq!(name, "RangeError");
                assert_eq!(error.to_string(), "range error: at estimate()");
            }
            other => panic!("unexpected error: {}", other)
        }

        let unregistered = RpcClient::new(session, "ops", short(true));
        assert!(matches!(unregistered.call("estimate", CallArgs::new()).await, Err(DispatchError::Rpc(_))));
        cancel.cancel();
    }
}

//! Connection lifecycle to the broker
//!
//! A session eagerly opens its connection and closes it exactly once: either
//! explicitly through [`BusSession::close`], at the end of
//! [`BusSession::scoped`], or as a best effort when the last handle is dropped.
//! Close is bounded by `close_timeout`; a transport that hangs on close is
//! abandoned rather than waited on.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering}
    }
};

use tracing::{Level, event};

use crate::{
    bus::{receiver::FromBus, sender::ToBus},
    domain::{address::Address, constant::bus, error::DispatchError},
    port::bus::{Broker, BusConnection, ConnectionOptions, ReceiverOptions}
};

struct SessionInner {
    connection: Arc<dyn BusConnection>,
    options:    ConnectionOptions,
    closed:     AtomicBool
}

impl SessionInner {
    async fn close(&self) -> Result<(), DispatchError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        close_bounded(self.connection.clone(), &self.options).await
    }
}

async fn close_bounded(connection: Arc<dyn BusConnection>, options: &ConnectionOptions) -> Result<(), DispatchError> {
    match tokio::time::timeout(options.close_timeout, connection.close()).await {
        Ok(result) => {
            event!(Level::DEBUG, event = bus::SESSION_CLOSED);
            result
        }
        Err(_) => {
            event!(Level::WARN, event = bus::SESSION_CLOSE_TIMEOUT, timeout = ?options.close_timeout);
            Ok(())
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        event!(Level::WARN, event = bus::SESSION_ABANDONED);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let connection = self.connection.clone();
            let options = self.options.clone();
            handle.spawn(async move {
                let _ = close_bounded(connection, &options).await;
            });
        }
    }
}

/// Shared handle to one broker connection
#[derive(Clone)]
pub struct BusSession {
    inner: Arc<SessionInner>
}

impl BusSession {
    pub async fn open(broker: &dyn Broker, options: ConnectionOptions) -> Result<Self, DispatchError> {
        let connection = broker.connect(&options).await?;
        event!(Level::DEBUG, event = bus::SESSION_OPENED, reconnect = options.reconnect);

        Ok(Self { inner: Arc::new(SessionInner { connection, options, closed: AtomicBool::new(false) }) })
    }

    /// Open a session, run `body` with it and close the session on every exit path
    pub async fn scoped<T, F, Fut>(broker: &dyn Broker, options: ConnectionOptions, body: F) -> Result<T, DispatchError>
    where
        F: FnOnce(BusSession) -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>
    {
        let session = Self::open(broker, options).await?;
        let result = body(session.clone()).await;
        let closed = session.close().await;

        let value = result?;
        closed?;
        Ok(value)
    }

    pub fn connection(&self) -> &Arc<dyn BusConnection> {
        &self.inner.connection
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire) && self.inner.connection.is_open()
    }

    /// Close the connection; later calls are no-ops
    pub async fn close(&self) -> Result<(), DispatchError> {
        self.inner.close().await
    }

    /// A sender bound to exactly one destination
    pub fn sender(&self, address: Address) -> ToBus {
        ToBus::new(self.clone(), address)
    }

    /// A receiver watching every address in `addresses`
    pub async fn receiver(&self, addresses: &[Address], options: ReceiverOptions) -> Result<FromBus, DispatchError> {
        let mut receiver = FromBus::new(self.clone(), options)?;
        for address in addresses {
            receiver.add_destination(address.clone()).await?;
        }
        Ok(receiver)
    }
}

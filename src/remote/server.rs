//! TCP server that hands out job arguments and collects results
//!
//! One task per connection, at most `max_connections` served at once. A
//! protocol violation closes only the offending connection.

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::Semaphore,
    task::JoinHandle
};
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

use crate::{
    domain::{constant::remote, error::DispatchError},
    remote::{
        RemoteOptions,
        codec::{FetchReply, Request, read_frame, write_frame},
        registry::JobRegistry
    }
};

pub struct JobServer {
    registry:   JobRegistry,
    local_addr: SocketAddr,
    cancel:     CancellationToken,
    task:       JoinHandle<()>
}

impl JobServer {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        registry: JobRegistry,
        options: &RemoteOptions
    ) -> Result<Self, DispatchError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DispatchError::Connection(format!("failed to bind job server: {}", e)))?;
        let local_addr = listener.local_addr().map_err(|e| DispatchError::Connection(e.to_string()))?;
        let cancel = CancellationToken::new();

        event!(Level::INFO, event = remote::SERVER_STARTED,
               address = %local_addr, max_connections = options.max_connections);

        let task = tokio::spawn(accept_loop(
            listener,
            registry.clone(),
            Arc::new(Semaphore::new(options.max_connections.max(1))),
            options.max_frame_bytes,
            cancel.clone()
        ));

        Ok(Self { registry, local_addr, cancel, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Stop accepting connections and wait for the accept loop to end
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
        event!(Level::INFO, event = remote::SERVER_STOPPED, address = %self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: JobRegistry,
    slots: Arc<Semaphore>,
    max_frame_bytes: usize,
    cancel: CancellationToken
) {
    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break
            }
        };

        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    event!(Level::WARN, event = remote::CONNECTION_FAILED, error = %e);
                    continue;
                }
            }
        };

        event!(Level::DEBUG, event = remote::CONNECTION_ACCEPTED, peer = %peer);
        let registry = registry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = serve_connection(stream, &registry, max_frame_bytes) => {
                    if let Err(e) = result {
                        event!(Level::WARN, event = remote::PROTOCOL_ERROR, peer = %peer, error = %e);
                    }
                }
            }
            drop(permit);
        });
    }
}

async fn serve_connection(mut stream: TcpStream, registry: &JobRegistry, max_frame_bytes: usize) -> Result<(), DispatchError> {
    while let Some(frame) = read_frame(&mut stream, max_frame_bytes).await? {
        match Request::decode(&frame)? {
            Request::Get { job_id } => {
                let reply = match registry.fetch(&job_id).await {
                    Ok(arguments) => FetchReply::Arguments(arguments),
                    Err(DispatchError::UnknownJob(id)) => FetchReply::UnknownJob(id),
                    Err(e) => FetchReply::Refused(e.to_string())
                };
                write_frame(&mut stream, &reply.encode()?).await?;
            }
            Request::Put { job_id, results } => {
                registry.complete(&job_id, results).await?;
            }
        }
    }
    let _ = stream.shutdown().await;
    Ok(())
}

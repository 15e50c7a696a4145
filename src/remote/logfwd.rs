//! Worker log side channel
//!
//! While a worker runs a job, a [`ForwardingLayer`] ships every log event as a
//! newline-delimited JSON [`LogRecord`] to the dispatcher's [`LogReceiver`],
//! which re-emits it through `tracing`.

use std::{collections::BTreeMap, fmt, net::SocketAddr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::mpsc,
    task::JoinHandle
};
use tokio_util::sync::CancellationToken;
use tracing::{
    Event, Level, Subscriber, event,
    field::{Field, Visit}
};
use tracing_subscriber::{Layer, layer::Context};

use crate::domain::{constant::remote, error::DispatchError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub job_id:    String,
    pub level:     String,
    pub target:    String,
    pub message:   String,
    #[serde(default)]
    pub fields:    BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>
}

enum Forward {
    Record(LogRecord),
    Flush
}

/// `tracing` layer that forwards events to a remote log receiver
pub struct ForwardingLayer {
    job_id: String,
    sender: mpsc::UnboundedSender<Forward>
}

/// Background writer of a [`ForwardingLayer`]
pub struct ForwardWriter {
    sender: mpsc::UnboundedSender<Forward>,
    task:   JoinHandle<()>
}

impl ForwardWriter {
    /// Flush everything forwarded so far and stop the writer
    pub async fn finish(self) {
        let _ = self.sender.send(Forward::Flush);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

impl ForwardingLayer {
    pub async fn connect(sink: SocketAddr, job_id: &str) -> Result<(Self, ForwardWriter), DispatchError> {
        let mut stream = TcpStream::connect(sink)
            .await
            .map_err(|e| DispatchError::Connection(format!("log sink {}: {}", sink, e)))?;
        let (sender, mut receiver) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Some(Forward::Record(record)) = receiver.recv().await {
                let Ok(mut line) = serde_json::to_vec(&record) else {
                    continue;
                };
                line.push(b'\n');
                if stream.write_all(&line).await.is_err() {
                    break;
                }
            }
            let _ = stream.shutdown().await;
        });

        Ok((Self { job_id: job_id.to_string(), sender: sender.clone() }, ForwardWriter { sender, task }))
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields:  BTreeMap<String, String>
}

impl RecordVisitor {
    fn put(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, format!("{:?}", value));
    }
}

impl<S: Subscriber> Layer<S> for ForwardingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let metadata = event.metadata();
        let _ = self.sender.send(Forward::Record(LogRecord {
            job_id:    self.job_id.clone(),
            level:     metadata.level().to_string(),
            target:    metadata.target().to_string(),
            message:   visitor.message,
            fields:    visitor.fields,
            timestamp: Utc::now()
        }));
    }
}

type RecordHandler = Arc<dyn Fn(LogRecord) + Send + Sync>;

/// Dispatcher-side listener for forwarded worker logs
pub struct LogReceiver {
    local_addr: SocketAddr,
    cancel:     CancellationToken,
    task:       JoinHandle<()>
}

impl LogReceiver {
    /// Re-emit every received record through `tracing`
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, DispatchError> {
        Self::bind_with(addr, emit).await
    }

    pub async fn bind_with<F>(addr: impl ToSocketAddrs, handler: F) -> Result<Self, DispatchError>
    where
        F: Fn(LogRecord) + Send + Sync + 'static
    {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DispatchError::Connection(format!("failed to bind log receiver: {}", e)))?;
        let local_addr = listener.local_addr().map_err(|e| DispatchError::Connection(e.to_string()))?;
        let cancel = CancellationToken::new();
        let handler: RecordHandler = Arc::new(handler);

        let token = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            event!(Level::WARN, event = remote::CONNECTION_FAILED, error = %e);
                            continue;
                        }
                    }
                };
                tokio::spawn(read_records(stream, handler.clone(), token.clone()));
            }
        });

        Ok(Self { local_addr, cancel, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn read_records(stream: TcpStream, handler: RecordHandler, cancel: CancellationToken) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line
        };
        match line {
            Ok(Some(line)) => match serde_json::from_str::<LogRecord>(&line) {
                Ok(record) => handler(record),
                Err(e) => event!(Level::WARN, event = remote::PROTOCOL_ERROR, error = %e, message = "bad log record")
            },
            Ok(None) => break,
            Err(e) => {
                event!(Level::WARN, event = remote::PROTOCOL_ERROR, error = %e);
                break;
            }
        }
    }
}

fn emit(record: LogRecord) {
    let LogRecord { job_id, level, target, message, .. } = record;
    match level.as_str() {
        "ERROR" => event!(Level::ERROR, event = remote::WORKER_LOG, job_id = %job_id, origin = %target, "{}", message),
        "WARN" => event!(Level::WARN, event = remote::WORKER_LOG, job_id = %job_id, origin = %target, "{}", message),
        "DEBUG" | "TRACE" => {
            event!(Level::DEBUG, event = remote::WORKER_LOG, job_id = %job_id, origin = %target, "{}", message)
        }
        _ => event!(Level::INFO, event = remote::WORKER_LOG, job_id = %job_id, origin = %target, "{}", message)
    }
}

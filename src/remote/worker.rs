//! Worker side of the remote job protocol

use std::{future::Future, net::SocketAddr, time::Duration};

use rand_core::{OsRng, RngCore};
use tokio::{io::AsyncWriteExt, net::TcpStream};
use tracing::{Level, event, instrument::WithSubscriber};
use tracing_subscriber::{fmt, layer::SubscriberExt};

use crate::{
    domain::{
        constant::remote,
        error::DispatchError,
        payload::{Payload, PayloadMap}
    },
    logging,
    remote::{
        RemoteOptions,
        codec::{FetchReply, Request, read_frame, write_frame},
        logfwd::ForwardingLayer
    }
};

/// Connect to `addr`, retrying with a jittered pause between attempts.
///
/// After `attempts` failures the last connection error is returned.
pub async fn connect_with_retry(addr: &str, options: &RemoteOptions) -> Result<TcpStream, DispatchError> {
    let attempts = options.connect_attempts.max(1);
    let mut attempt = 1;

    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt < attempts => {
                let pause = jitter(options.retry_min, options.retry_max);
                event!(Level::WARN, event = remote::CONNECT_RETRY,
                       address = %addr, attempt = attempt, pause_ms = pause.as_millis() as u64, error = %e);
                tokio::time::sleep(pause).await;
                attempt += 1;
            }
            Err(e) => {
                event!(Level::ERROR, event = remote::CONNECTION_FAILED, address = %addr, attempts = attempts, error = %e);
                return Err(DispatchError::Connection(format!("{}: {}", addr, e)));
            }
        }
    }
}

/// Uniformly random duration in `[min, max]`
fn jitter(min: Duration, max: Duration) -> Duration {
    let (low, high) = if min <= max { (min, max) } else { (max, min) };
    let span = (high - low).as_millis() as u64;
    low + Duration::from_millis(OsRng.next_u64() % (span + 1))
}

/// A worker process bound to one job on one dispatcher
#[derive(Debug, Clone)]
pub struct RemoteWorker {
    job_id:   String,
    server:   String,
    options:  RemoteOptions,
    log_sink: Option<SocketAddr>
}

impl RemoteWorker {
    pub fn new(job_id: impl Into<String>, host: &str, port: u16, options: RemoteOptions) -> Self {
        Self { job_id: job_id.into(), server: format!("{}:{}", host, port), options, log_sink: None }
    }

    /// Forward this worker's log output to a [`LogReceiver`](crate::remote::LogReceiver) while it runs
    pub fn with_log_sink(mut self, sink: SocketAddr) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn fetch_arguments(&self) -> Result<Vec<Payload>, DispatchError> {
        let mut stream = connect_with_retry(&self.server, &self.options).await?;
        let request = Request::Get { job_id: self.job_id.clone() };
        write_frame(&mut stream, &request.encode()?).await?;

        let reply = read_frame(&mut stream, self.options.max_frame_bytes)
            .await?
            .ok_or_else(|| DispatchError::Protocol(format!("server closed before answering GET {}", self.job_id)))?;
        let _ = stream.shutdown().await;
        FetchReply::decode(&reply)?.into_arguments()
    }

    /// Send results; sending the same results again is harmless
    pub async fn return_results(&self, results: &PayloadMap) -> Result<(), DispatchError> {
        let mut stream = connect_with_retry(&self.server, &self.options).await?;
        let request = Request::Put { job_id: self.job_id.clone(), results: results.clone() };
        write_frame(&mut stream, &request.encode()?).await?;
        stream.shutdown().await.map_err(|e| DispatchError::Connection(e.to_string()))
    }

    /// Fetch arguments, run `execute` on them and return its results.
    ///
    /// With a log sink configured, log output is forwarded for the duration of
    /// this call only.
    pub async fn run<F, Fut>(&self, execute: F) -> Result<PayloadMap, DispatchError>
    where
        F: FnOnce(Vec<Payload>) -> Fut,
        Fut: Future<Output = Result<PayloadMap, DispatchError>>
    {
        let job = async {
            let arguments = self.fetch_arguments().await?;
            event!(Level::INFO, event = remote::JOB_FETCHED, job_id = %self.job_id, arguments = arguments.len());

            let results = execute(arguments).await?;
            self.return_results(&results).await?;
            event!(Level::INFO, event = remote::JOB_COMPLETED, job_id = %self.job_id);
            Ok(results)
        };

        let Some(sink) = self.log_sink else {
            return job.await;
        };

        let (layer, writer) = ForwardingLayer::connect(sink, &self.job_id).await?;
        let subscriber = tracing_subscriber::registry()
            .with(logging::env_filter("info"))
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(layer);

        let result = job.with_subscriber(subscriber).await;
        writer.finish().await;
        result
    }
}

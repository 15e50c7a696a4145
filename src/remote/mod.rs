//! Remote job protocol
//!
//! A dispatcher registers jobs and serves their argument lists over TCP; each
//! worker connects, fetches its arguments with `GET <job_id>`, runs, and
//! returns a results mapping with `PUT <job_id> <results>`. Every message is a
//! 4-byte big-endian length followed by that many bytes.

use std::time::Duration;

pub mod codec;
pub mod dispatcher;
pub mod logfwd;
pub mod registry;
pub mod server;
pub mod worker;

pub use dispatcher::{DispatchReport, JobDispatcher};
pub use logfwd::{LogReceiver, LogRecord};
pub use registry::JobRegistry;
pub use server::JobServer;
pub use worker::RemoteWorker;

/// Tuning shared by both ends of the protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOptions {
    /// Connection attempts before a worker gives up
    pub connect_attempts: u32,
    /// Jittered sleep between attempts is drawn from `[retry_min, retry_max]`
    pub retry_min:        Duration,
    pub retry_max:        Duration,
    /// Connections served at once by the job server
    pub max_connections:  usize,
    /// Largest frame either side accepts
    pub max_frame_bytes:  usize
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            retry_min:        Duration::from_secs(1),
            retry_max:        Duration::from_secs(5),
            max_connections:  64,
            max_frame_bytes:  64 * 1024 * 1024
        }
    }
}

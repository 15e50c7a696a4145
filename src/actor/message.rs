//! Typed messages for the daemon actor

use ractor::{Message, RpcReplyPort};
use serde::Serialize;

use crate::domain::{error::DispatchError, message::Message as BusMessage};

/// Messages for the QueueDaemon actor
#[derive(Debug)]
pub enum DaemonMessage {
    /// A command consumed from the host's command queue
    ProcessCommand { message: Box<BusMessage>, reply: RpcReplyPort<Result<CommandOutcome, DispatchError>> },
    /// A message the broker could not deliver; `origin` is the address it was sent to
    ProcessDeadletter {
        message: Box<BusMessage>,
        origin:  Option<String>,
        reply:   RpcReplyPort<Result<DeadletterOutcome, DispatchError>>
    },
    /// Reconcile subprocess state with tracked jobs
    ProcessState { reply: RpcReplyPort<Result<usize, DispatchError>> },
    /// Snapshot of the daemon counters
    GetStats { reply: RpcReplyPort<DaemonStats> }
}

/// What a command did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    JobStarted { job_uuid: String },
    SessionStopped { session_uuid: String, killed: usize },
    /// `stop_session` for a session that was already stopped
    AlreadyStopped { session_uuid: String },
    /// `kill_job`; `killed` is false when the job had already been killed
    JobKilled { job_uuid: String, killed: bool },
    EchoReplied
}

/// What happened to a deadletter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadletterOutcome {
    Reposted { attempt: u32 },
    /// Repost budget exhausted; the job or session was torn down
    Retired { teardown: bool },
    /// Repost budget exhausted for a job owned by `host`; the teardown was sent to its command queue
    Forwarded { host: String },
    /// Not a job-channel deadletter
    Ignored
}

/// Daemon counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DaemonStats {
    pub jobs_started:     u64,
    pub jobs_completed:   u64,
    pub jobs_killed:      u64,
    pub sessions_stopped: u64,
    pub reposts:          u64,
    pub retired:          u64,
    pub forwarded:        u64,
    pub queued:           usize,
    pub running:          usize
}

impl Message for DaemonMessage {}

//! Domain Events - Structured event names for internal monitoring and debugging

/// Bus session events
pub mod bus {
    pub const SESSION_OPENED: &str = "session.opened";
    pub const SESSION_CLOSED: &str = "session.closed";
    pub const SESSION_CLOSE_TIMEOUT: &str = "session.close_timeout";
    pub const SESSION_ABANDONED: &str = "session.abandoned";
    pub const MESSAGE_SENT: &str = "message.sent";
    pub const MESSAGE_RECEIVED: &str = "message.received";
    pub const MESSAGE_DEADLETTERED: &str = "message.deadlettered";
    pub const MESSAGE_EXPIRED: &str = "message.expired";
    pub const DESTINATION_DELETED: &str = "destination.deleted";
}

/// Subprocess group events
pub mod group {
    pub const PROCESS_STARTED: &str = "process.started";
    pub const PROCESS_QUEUED: &str = "process.queued";
    pub const PROCESS_ADMITTED: &str = "process.admitted";
    pub const PROCESS_FINISHED: &str = "process.finished";
    pub const PROCESS_FAILED: &str = "process.failed";
    pub const PROCESS_KILLED: &str = "process.killed";
    pub const PROCESS_LAUNCH_FAILED: &str = "process.launch_failed";
    pub const GROUP_FINISHED: &str = "group.finished";
}

/// Remote job protocol events
pub mod remote {
    pub const SERVER_STARTED: &str = "server.started";
    pub const SERVER_STOPPED: &str = "server.stopped";
    pub const CONNECTION_ACCEPTED: &str = "connection.accepted";
    pub const CONNECTION_FAILED: &str = "connection.failed";
    pub const CONNECT_RETRY: &str = "connect.retry";
    pub const PROTOCOL_ERROR: &str = "protocol.error";
    pub const JOB_REGISTERED: &str = "job.registered";
    pub const JOB_DISPATCHED: &str = "job.dispatched";
    pub const JOB_FETCHED: &str = "job.fetched";
    pub const JOB_COMPLETED: &str = "job.completed";
    pub const JOB_FAILED: &str = "job.failed";
    pub const RESULT_DUPLICATE: &str = "result.duplicate";
    pub const WORKER_LOG: &str = "worker.log";
}

/// Request/reply RPC events
pub mod rpc {
    pub const CALL_STARTED: &str = "call.started";
    pub const CALL_SUCCEEDED: &str = "call.succeeded";
    pub const CALL_TIMEOUT: &str = "call.timeout";
    pub const CALL_FAILED: &str = "call.failed";
    pub const SERVICE_STARTED: &str = "service.started";
    pub const SERVICE_STOPPED: &str = "service.stopped";
    pub const REQUEST_HANDLED: &str = "request.handled";
    pub const REQUEST_INVALID: &str = "request.invalid";
}

/// Command-queue daemon events
pub mod daemon {
    pub const DAEMON_STARTED: &str = "daemon.started";
    pub const DAEMON_STOPPED: &str = "daemon.stopped";
    pub const COMMAND_RECEIVED: &str = "command.received";
    pub const COMMAND_UNKNOWN: &str = "command.unknown";
    pub const COMMAND_FAILED: &str = "command.failed";
    pub const REPLY_DROPPED: &str = "reply.dropped";
    pub const STEP_FAILED: &str = "step.failed";
    pub const MESSAGE_MALFORMED: &str = "message.malformed";
    pub const JOB_STARTED: &str = "job.started";
    pub const JOB_COMPLETED: &str = "job.completed";
    pub const JOB_KILLED: &str = "job.killed";
    pub const SESSION_STOPPED: &str = "session.stopped";
    pub const DEADLETTER_RECEIVED: &str = "deadletter.received";
    pub const DEADLETTER_REPOSTED: &str = "deadletter.reposted";
    pub const DEADLETTER_RETIRED: &str = "deadletter.retired";
    pub const DEADLETTER_FORWARDED: &str = "deadletter.forwarded";
    pub const SESSIONS_FORGOTTEN: &str = "sessions.forgotten";
    pub const STATE_RECONCILED: &str = "state.reconciled";
    pub const ECHO_SENT: &str = "echo.sent";
    pub const ECHO_REPLIED: &str = "echo.replied";
    pub const ECHO_STRAGGLERS: &str = "echo.stragglers";
}

//! QueueDaemon actor - executes jobs on behalf of a master
//!
//! All daemon state is owned by this actor; the receive loop only talks to it
//! through messages. Three entry points:
//! - `ProcessCommand`: `run_job`, `kill_job`, `stop_session` and `echo` commands
//! - `ProcessDeadletter`: bounded repost of undeliverable job-channel messages,
//!   then teardown of the job (parameters) or the whole session (results).
//!   Teardown of a job owned by another host is sent to that host's command queue.
//! - `ProcessState`: poll the subprocesses and publish results of finished jobs

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
    time::Duration
};

use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{Level, event};

use crate::{
    actor::{
        job_manager::{JobCompletion, JobManager},
        message::{CommandOutcome, DaemonMessage, DaemonStats, DeadletterOutcome}
    },
    bus::BusSession,
    config::DispatchConfig,
    domain::{
        address::{Address, JobChannel},
        constant::daemon,
        error::DispatchError,
        message::Message,
        payload::{Payload, PayloadMap}
    },
    group::SubprocessGroup
};

/// Payload key of the repost counter
pub const N_REPOST: &str = "n_repost";
/// Payload key of the host that owns the job
pub const HOST: &str = "host";

/// Lifecycle of a job on this host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonJobState {
    Queued,
    Running,
    Completed,
    Killed
}

#[derive(Debug, Clone)]
struct TrackedJob {
    session_uuid: String,
    state:        DaemonJobState
}

impl TrackedJob {
    fn is_live(&self) -> bool {
        matches!(self.state, DaemonJobState::Queued | DaemonJobState::Running)
    }
}

/// Everything the daemon needs to start
pub struct DaemonArgs {
    pub session:     BusSession,
    pub bus:         String,
    pub host:        String,
    pub max_repost:  u32,
    /// TTL of every job-channel message this daemon sends
    pub message_ttl: Duration,
    /// How long a stopped session keeps refusing new jobs
    pub retention:   Duration,
    pub group:       Arc<SubprocessGroup>
}

impl DaemonArgs {
    /// Daemon settings from the `daemon` section, with a subprocess group built from the `group` section
    pub fn from_config(
        session: BusSession,
        bus: impl Into<String>,
        host: impl Into<String>,
        config: &DispatchConfig
    ) -> Self {
        Self {
            session,
            bus: bus.into(),
            host: host.into(),
            max_repost: config.daemon.max_repost,
            message_ttl: config.daemon.message_ttl(),
            retention: config.daemon.retention(),
            group: Arc::new(SubprocessGroup::new(config.group.options()))
        }
    }
}

/// QueueDaemon Actor State
pub struct DaemonState {
    session:          BusSession,
    bus:              String,
    host:             String,
    max_repost:       u32,
    message_ttl:      Duration,
    retention:        Duration,
    jobs:             JobManager,
    /// Live jobs by job uuid
    tracked:          HashMap<String, TrackedJob>,
    /// Stopped sessions and when they were stopped
    stopped_sessions: HashMap<String, Instant>,
    stats:            DaemonStats
}

/// QueueDaemon Actor
pub struct QueueDaemon;

#[async_trait::async_trait]
impl Actor for QueueDaemon {
    type Arguments = DaemonArgs;
    type Msg = DaemonMessage;
    type State = DaemonState;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments
    ) -> Result<Self::State, ActorProcessingErr> {
        event!(Level::INFO, event = daemon::DAEMON_STARTED,
               host = %args.host, bus = %args.bus, max_repost = args.max_repost);

        Ok(DaemonState {
            session:          args.session,
            bus:              args.bus,
            host:             args.host,
            max_repost:       args.max_repost,
            message_ttl:      args.message_ttl,
            retention:        args.retention,
            jobs:             JobManager::new(args.group),
            tracked:          HashMap::new(),
            stopped_sessions: HashMap::new(),
            stats:            DaemonStats::default()
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DaemonMessage::ProcessCommand { message, reply } => {
                let result = self.process_command(*message, state).await;
                respond(reply, result);
            }
            DaemonMessage::ProcessDeadletter { message, origin, reply } => {
                let result = self.process_deadletter(*message, origin.as_deref(), state).await;
                respond(reply, result);
            }
            DaemonMessage::ProcessState { reply } => {
                let result = self.process_state(state).await;
                respond(reply, result);
            }
            DaemonMessage::GetStats { reply } => {
                let mut stats = state.stats.clone();
                stats.queued = state.jobs.queued();
                stats.running = state.jobs.running().len();
                respond(reply, stats);
            }
        }
        Ok(())
    }

    async fn post_stop(&self, _myself: ActorRef<Self::Msg>, state: &mut Self::State) -> Result<(), ActorProcessingErr> {
        event!(Level::INFO, event = daemon::DAEMON_STOPPED, host = %state.host, stats = ?state.stats);
        Ok(())
    }
}

fn respond<T>(reply: RpcReplyPort<T>, value: T) {
    if reply.send(value).is_err() {
        event!(Level::WARN, event = daemon::REPLY_DROPPED);
    }
}

impl QueueDaemon {
    pub async fn spawn(args: DaemonArgs) -> Result<(ActorRef<DaemonMessage>, JoinHandle<()>), DispatchError> {
        Ok(Actor::spawn(None, QueueDaemon, args).await?)
    }

    async fn process_command(&self, message: Message, state: &mut DaemonState) -> Result<CommandOutcome, DispatchError> {
        let payload = message.payload.unwrap_or_default();
        let command = payload.require_str("command")?;
        event!(Level::DEBUG, event = daemon::COMMAND_RECEIVED, command = %command, message_id = %message.header.source.uuid);

        match command {
            "run_job" => self.run_job(&payload, state).await,
            "stop_session" => self.stop_session(payload.require_str("session_uuid")?, state),
            "kill_job" => {
                let job_uuid = payload.require_str("job_uuid")?.to_string();
                let killed = self.kill_job(&job_uuid, state)?;
                Ok(CommandOutcome::JobKilled { job_uuid, killed })
            }
            "echo" => {
                let return_subject: Address = payload.require_str("return_subject")?.parse()?;
                let reply = Message::event(Payload::map([
                    (HOST, Payload::str(state.host.as_str())),
                    ("echo_type", Payload::str("slave_echo_reply"))
                ]));
                state.session.sender(return_subject.clone()).send(&reply).await?;
                event!(Level::DEBUG, event = daemon::ECHO_REPLIED, return_subject = %return_subject);
                Ok(CommandOutcome::EchoReplied)
            }
            other => {
                event!(Level::WARN, event = daemon::COMMAND_UNKNOWN, command = %other);
                Err(DispatchError::Validation(format!("unknown command '{}'", other)))
            }
        }
    }

    async fn run_job(&self, payload: &Payload, state: &mut DaemonState) -> Result<CommandOutcome, DispatchError> {
        let session_uuid = payload.require_str("session_uuid")?.to_string();
        let job_uuid = payload.require_str("job_uuid")?.to_string();
        let argv = job_argv(payload.get("job_command"))?;
        let working_dir = payload.get("working_dir").and_then(Payload::as_str).map(PathBuf::from);

        if state.stopped_sessions.contains_key(&session_uuid) {
            return Err(DispatchError::Validation(format!("session {} was stopped", session_uuid)));
        }
        if state.tracked.contains_key(&job_uuid) {
            return Err(DispatchError::Validation(format!("job {} is already known", job_uuid)));
        }

        state.jobs.start(&session_uuid, &job_uuid, argv, working_dir);
        state.tracked.insert(job_uuid.clone(), TrackedJob {
            session_uuid: session_uuid.clone(),
            state:        DaemonJobState::Queued
        });
        state.stats.jobs_started += 1;
        event!(Level::INFO, event = daemon::JOB_STARTED, session_uuid = %session_uuid, job_uuid = %job_uuid);

        // Declared up front so the parameters wait for the job instead of bouncing to the deadletters.
        let address = Address::job_channel(&state.bus, &session_uuid, &job_uuid, JobChannel::Parameters);
        state.session.connection().declare(&address).await?;

        let mut parameters = job_message(&state.host, &session_uuid, &job_uuid, [(
            "parameters",
            payload.get("parameters").cloned().unwrap_or_default()
        )]);
        parameters.set_ttl(state.message_ttl);
        state.session.sender(address).send(&parameters).await?;

        Ok(CommandOutcome::JobStarted { job_uuid })
    }

    /// Kill every job of a session; a second stop is a no-op
    fn stop_session(&self, session_uuid: &str, state: &mut DaemonState) -> Result<CommandOutcome, DispatchError> {
        if state.stopped_sessions.contains_key(session_uuid) {
            return Ok(CommandOutcome::AlreadyStopped { session_uuid: session_uuid.to_string() });
        }
        state.stopped_sessions.insert(session_uuid.to_string(), Instant::now());

        let killed = state.jobs.kill_session(session_uuid)?;
        for job in state.tracked.values_mut().filter(|job| job.session_uuid == session_uuid && job.is_live()) {
            job.state = DaemonJobState::Killed;
        }
        state.stats.sessions_stopped += 1;
        event!(Level::INFO, event = daemon::SESSION_STOPPED, session_uuid = %session_uuid, killed = killed);

        Ok(CommandOutcome::SessionStopped { session_uuid: session_uuid.to_string(), killed })
    }

    /// Kill a live job of this host; false when it is unknown, finished or already killed
    fn kill_job(&self, job_uuid: &str, state: &mut DaemonState) -> Result<bool, DispatchError> {
        let Some(job) = state.tracked.get_mut(job_uuid).filter(|job| job.is_live()) else {
            return Ok(false);
        };
        job.state = DaemonJobState::Killed;

        let killed = state.jobs.kill_job(job_uuid)?;
        state.stats.jobs_killed += 1;
        event!(Level::WARN, event = daemon::JOB_KILLED, job_uuid = %job_uuid, processes = killed);
        Ok(true)
    }

    async fn process_deadletter(
        &self,
        message: Message,
        origin: Option<&str>,
        state: &mut DaemonState
    ) -> Result<DeadletterOutcome, DispatchError> {
        let Some((origin, channel)) = origin
            .and_then(|origin| origin.parse::<Address>().ok())
            .and_then(|address| address.parse_job_channel().map(|(_, _, channel)| (address, channel)))
        else {
            event!(Level::DEBUG, event = daemon::DEADLETTER_RECEIVED, origin = ?origin, message = "not a job channel");
            return Ok(DeadletterOutcome::Ignored);
        };

        let mut payload = message.payload.clone().unwrap_or_default();
        let session_uuid = payload.require_str("session_uuid")?.to_string();
        let job_uuid = payload.require_str("job_uuid")?.to_string();
        let n_repost = payload.get(N_REPOST).and_then(Payload::as_i64).unwrap_or(0).max(0) as u32;
        event!(Level::DEBUG, event = daemon::DEADLETTER_RECEIVED,
               origin = %origin, job_uuid = %job_uuid, n_repost = n_repost);

        if n_repost < state.max_repost {
            let attempt = n_repost + 1;
            if let Some(map) = payload.as_map_mut() {
                map.insert(N_REPOST.to_string(), Payload::Int(attempt as i64));
            }
            let mut repost = message;
            repost.payload = Some(payload);
            repost.set_ttl(state.message_ttl);
            state.session.sender(origin.clone()).send(&repost).await?;

            state.stats.reposts += 1;
            event!(Level::INFO, event = daemon::DEADLETTER_REPOSTED, origin = %origin, attempt = attempt);
            return Ok(DeadletterOutcome::Reposted { attempt });
        }

        state.stats.retired += 1;
        event!(Level::WARN, event = daemon::DEADLETTER_RETIRED, origin = %origin, n_repost = n_repost);

        let owner = payload.get(HOST).and_then(Payload::as_str).filter(|host| *host != state.host);
        if let Some(owner) = owner {
            let teardown = match channel {
                JobChannel::Parameters => Payload::map([
                    ("command", Payload::str("kill_job")),
                    ("session_uuid", Payload::str(session_uuid.as_str())),
                    ("job_uuid", Payload::str(job_uuid.as_str()))
                ]),
                JobChannel::ExitValue | JobChannel::Output => Payload::map([
                    ("command", Payload::str("stop_session")),
                    ("session_uuid", Payload::str(session_uuid.as_str()))
                ])
            };
            state.session.sender(Address::command(&state.bus, owner)).send(&Message::command(teardown)).await?;

            state.stats.forwarded += 1;
            event!(Level::WARN, event = daemon::DEADLETTER_FORWARDED, origin = %origin, host = %owner);
            return Ok(DeadletterOutcome::Forwarded { host: owner.to_string() });
        }

        let teardown = match channel {
            JobChannel::Parameters => self.kill_job(&job_uuid, state)?,
            JobChannel::ExitValue | JobChannel::Output => {
                matches!(self.stop_session(&session_uuid, state)?, CommandOutcome::SessionStopped { .. })
            }
        };
        Ok(DeadletterOutcome::Retired { teardown })
    }

    async fn process_state(&self, state: &mut DaemonState) -> Result<usize, DispatchError> {
        let completions = state.jobs.reconcile().await;
        let finished = completions.len();

        for JobCompletion { session_uuid, job_uuid, completion } in completions {
            let killed = completion.killed ||
                state.tracked.get(&job_uuid).is_some_and(|job| job.state == DaemonJobState::Killed);
            if let Some(job) = state.tracked.get_mut(&job_uuid) {
                job.state = if killed { DaemonJobState::Killed } else { DaemonJobState::Completed };
            }
            if killed {
                continue;
            }

            state.stats.jobs_completed += 1;
            event!(Level::INFO, event = daemon::JOB_COMPLETED, job_uuid = %job_uuid, exit_code = completion.exit_code);

            let exit_code = Payload::Int(completion.exit_code as i64);
            let exit_value = job_message(&state.host, &session_uuid, &job_uuid, [("exit_value", exit_code)]);
            let output = job_message(&state.host, &session_uuid, &job_uuid, [
                ("stdout", Payload::str(completion.output.stdout)),
                ("stderr", Payload::str(completion.output.stderr))
            ]);
            for (channel, mut message) in [(JobChannel::ExitValue, exit_value), (JobChannel::Output, output)] {
                message.set_ttl(state.message_ttl);
                let address = Address::job_channel(&state.bus, &session_uuid, &job_uuid, channel);
                state.session.sender(address).send(&message).await?;
            }
        }

        let running: HashSet<String> = state.jobs.running().into_iter().collect();
        for (job_uuid, job) in state.tracked.iter_mut() {
            if job.state == DaemonJobState::Queued && running.contains(job_uuid) {
                job.state = DaemonJobState::Running;
            }
        }
        state.tracked.retain(|_, job| job.is_live());

        let retention = state.retention;
        let before = state.stopped_sessions.len();
        state.stopped_sessions.retain(|_, stopped_at| stopped_at.elapsed() < retention);
        let forgotten = before - state.stopped_sessions.len();
        if forgotten > 0 {
            event!(Level::DEBUG, event = daemon::SESSIONS_FORGOTTEN, forgotten = forgotten);
        }

        if finished > 0 {
            event!(Level::DEBUG, event = daemon::STATE_RECONCILED,
                   finished = finished, running = running.len(), tracked = state.tracked.len());
        }
        Ok(finished)
    }
}

/// Message on a job channel: `{host, session_uuid, job_uuid, n_repost: 0, ..fields}`
fn job_message<const N: usize>(host: &str, session_uuid: &str, job_uuid: &str, fields: [(&str, Payload); N]) -> Message {
    let mut map = PayloadMap::from([
        (HOST.to_string(), Payload::str(host)),
        ("session_uuid".to_string(), Payload::str(session_uuid)),
        ("job_uuid".to_string(), Payload::str(job_uuid)),
        (N_REPOST.to_string(), Payload::Int(0))
    ]);
    map.extend(fields.into_iter().map(|(key, value)| (key.to_string(), value)));
    Message::event(Payload::Map(map))
}

/// `job_command` is either an argv list or a shell command line
fn job_argv(command: Option<&Payload>) -> Result<Vec<String>, DispatchError> {
    match command {
        Some(Payload::Str(line)) if !line.trim().is_empty() => {
            Ok(vec!["sh".to_string(), "-c".to_string(), line.clone()])
        }
        Some(Payload::List(items)) if !items.is_empty() => Ok(items.iter().map(Payload::to_arg).collect()),
        _ => Err(DispatchError::Validation("run_job needs a non-empty job_command".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ractor::rpc::{CallResult, call};

    use super::*;
    use crate::{adapter::memory_bus::InMemoryBroker, port::bus::ReceiverOptions};

    fn test_config(max_repost: u32) -> DispatchConfig {
        let mut config = DispatchConfig::default();
        config.group.max_concurrent = 4;
        config.group.poll_interval_ms = 10;
        config.daemon.max_repost = max_repost;
        config
    }

    async fn start_with(broker: &InMemoryBroker, host: &str, config: &DispatchConfig) -> (ActorRef<DaemonMessage>, BusSession) {
        let session = BusSession::open(broker, config.bus.connection()).await.unwrap();
        let args = DaemonArgs::from_config(session.clone(), "ops", host, config);
        let (daemon, _) = QueueDaemon::spawn(args).await.unwrap();
        (daemon, session)
    }

    async fn start(broker: &InMemoryBroker, max_repost: u32) -> (ActorRef<DaemonMessage>, BusSession) {
        start_with(broker, "node01", &test_config(max_repost)).await
    }

    async fn command(daemon: &ActorRef<DaemonMessage>, payload: Payload) -> Result<CommandOutcome, DispatchError> {
        match call(daemon, |reply| DaemonMessage::ProcessCommand { message: Box::new(Message::command(payload)), reply }, None)
            .await
            .unwrap()
        {
            CallResult::Success(result) => result,
            _ => panic!("daemon did not answer")
        }
    }

    async fn deadletter(daemon: &ActorRef<DaemonMessage>, message: Message, origin: &str) -> DeadletterOutcome {
        let origin = Some(origin.to_string());
        match call(daemon, |reply| DaemonMessage::ProcessDeadletter { message: Box::new(message), origin, reply }, None)
            .await
            .unwrap()
        {
            CallResult::Success(result) => result.unwrap(),
            _ => panic!("daemon did not answer")
        }
    }

    async fn reconcile(daemon: &ActorRef<DaemonMessage>) -> usize {
        match call(daemon, |reply| DaemonMessage::ProcessState { reply }, None).await.unwrap() {
            CallResult::Success(result) => result.unwrap(),
            _ => panic!("daemon did not answer")
        }
    }

    async fn stats(daemon: &ActorRef<DaemonMessage>) -> DaemonStats {
        match call(daemon, |reply| DaemonMessage::GetStats { reply }, None).await.unwrap() {
            CallResult::Success(stats) => stats,
            _ => panic!("daemon did not answer")
        }
    }

    fn run_job(session: &str, job: &str, command: &str) -> Payload {
        Payload::map([
            ("command", Payload::str("run_job")),
            ("session_uuid", Payload::str(session)),
            ("job_uuid", Payload::str(job)),
            ("job_command", Payload::str(command)),
            ("parameters", Payload::map([("subband", Payload::Int(12))]))
        ])
    }

    #[tokio::test]
    async fn test_run_job_sends_parameters() {
        let broker = InMemoryBroker::new("ops");
        let (daemon, session) = start(&broker, 3).await;
        let parameters = Address::job_channel("ops", "s1", "j1", JobChannel::Parameters);
        let receiver = session.receiver(&[parameters], ReceiverOptions::default()).await.unwrap();

        let outcome = command(&daemon, run_job("s1", "j1", "sleep 5")).await.unwrap();
        assert_eq!(outcome, CommandOutcome::JobStarted { job_uuid: "j1".to_string() });

        let delivery = receiver.receive(Duration::from_secs(2)).await.unwrap().unwrap();
        let payload = delivery.message().unwrap().payload.unwrap();
        assert_eq!(payload.get("parameters").and_then(|p| p.get("subband")), Some(&Payload::Int(12)));
        assert_eq!(payload.get(N_REPOST), Some(&Payload::Int(0)));
        assert_eq!(payload.get(HOST), Some(&Payload::str("node01")));
        assert_eq!(delivery.envelope.properties.ttl, Some(Duration::from_secs(60)));

        assert!(command(&daemon, run_job("s1", "j1", "true")).await.is_err());
        command(&daemon, Payload::map([("command", Payload::str("stop_session")), ("session_uuid", Payload::str("s1"))]))
            .await
            .unwrap();
        daemon.stop(None);
    }

    #[tokio::test]
    async fn test_stop_session_is_idempotent() {
        let broker = InMemoryBroker::new("ops");
        let (daemon, _session) = start(&broker, 3).await;
        command(&daemon, run_job("s1", "j1", "sleep 30")).await.unwrap();
        command(&daemon, run_job("s1", "j2", "sleep 30")).await.unwrap();

        let stop = || Payload::map([("command", Payload::str("stop_session")), ("session_uuid", Payload::str("s1"))]);
        assert!(matches!(command(&daemon, stop()).await.unwrap(), CommandOutcome::SessionStopped { killed: 2, .. }));
        assert!(matches!(command(&daemon, stop()).await.unwrap(), CommandOutcome::AlreadyStopped { .. }));

        let unknown = Payload::map([("command", Payload::str("stop_session")), ("session_uuid", Payload::str("nope"))]);
        assert!(matches!(command(&daemon, unknown).await.unwrap(), CommandOutcome::SessionStopped { killed: 0, .. }));
        assert_eq!(stats(&daemon).await.sessions_stopped, 2);
        daemon.stop(None);
    }

    #[tokio::test]
    async fn test_parameters_repost_bound_then_single_kill() {
        let broker = InMemoryBroker::new("ops");
        let (daemon, _session) = start(&broker, 2).await;
        command(&daemon, run_job("s1", "j1", "sleep 30")).await.unwrap();

        let origin = "ops/s1.j1.parameters";
        let mut letter = job_message("node01", "s1", "j1", [("parameters", Payload::Null)]);
        let mut outcomes = Vec::new();
        for _ in 0..4 {
            let outcome = deadletter(&daemon, letter.clone(), origin).await;
            if let DeadletterOutcome::Reposted { attempt } = outcome {
                letter.payload.as_mut().and_then(Payload::as_map_mut).unwrap().insert(N_REPOST.into(), Payload::Int(attempt as i64));
            }
            outcomes.push(outcome);
        }

        assert_eq!(outcomes, vec![
            DeadletterOutcome::Reposted { attempt: 1 },
            DeadletterOutcome::Reposted { attempt: 2 },
            DeadletterOutcome::Retired { teardown: true },
            DeadletterOutcome::Retired { teardown: false }
        ]);
        let stats = stats(&daemon).await;
        assert_eq!(stats.jobs_killed, 1);
        assert_eq!(stats.reposts, 2);
        daemon.stop(None);
    }

    #[tokio::test]
    async fn test_result_deadletter_tears_down_session() {
        let broker = InMemoryBroker::new("ops");
        let (daemon, _session) = start(&broker, 0).await;
        command(&daemon, run_job("s2", "j1", "sleep 30")).await.unwrap();
        command(&daemon, run_job("s2", "j2", "sleep 30")).await.unwrap();

        let letter = job_message("node01", "s2", "j1", [("exit_value", Payload::Int(0))]);
        let first = deadletter(&daemon, letter.clone(), "ops/s2.j1.exit_value").await;
        let second = deadletter(&daemon, letter, "ops/s2.j1.output").await;

        assert_eq!(first, DeadletterOutcome::Retired { teardown: true });
        assert_eq!(second, DeadletterOutcome::Retired { teardown: false });
        assert_eq!(stats(&daemon).await.sessions_stopped, 1);
        daemon.stop(None);
    }

    #[tokio::test]
    async fn test_parameters_wait_for_a_queued_job() {
        let broker = InMemoryBroker::new("ops");
        let mut config = test_config(3);
        config.group.max_concurrent = 1;
        let (daemon, _session) = start_with(&broker, "node01", &config).await;

        command(&daemon, run_job("s1", "j1", "sleep 30")).await.unwrap();
        command(&daemon, run_job("s1", "j2", "sleep 30")).await.unwrap();
        assert_eq!(stats(&daemon).await.queued, 1);

        let waiting = Address::job_channel("ops", "s1", "j2", JobChannel::Parameters);
        assert_eq!(broker.queue_depth(&waiting), 1);
        assert_eq!(broker.queue_depth(&Address::deadletter("ops")), 0);

        command(&daemon, Payload::map([("command", Payload::str("stop_session")), ("session_uuid", Payload::str("s1"))]))
            .await
            .unwrap();
        daemon.stop(None);
    }

    #[tokio::test]
    async fn test_exhausted_deadletter_of_another_host_is_forwarded_to_owner() {
        let broker = InMemoryBroker::new("ops");
        let (owner, owner_session) = start_with(&broker, "node01", &test_config(3)).await;
        let (other, _other_session) = start_with(&broker, "node02", &test_config(0)).await;
        let owner_commands =
            owner_session.receiver(&[Address::command("ops", "node01")], ReceiverOptions::default()).await.unwrap();
        command(&owner, run_job("s1", "j1", "sleep 30")).await.unwrap();

        let letter = job_message("node01", "s1", "j1", [("parameters", Payload::Null)]);
        let outcome = deadletter(&other, letter, "ops/s1.j1.parameters").await;
        assert_eq!(outcome, DeadletterOutcome::Forwarded { host: "node01".to_string() });
        assert_eq!(stats(&other).await.jobs_killed, 0);
        assert_eq!(stats(&other).await.forwarded, 1);

        let forwarded = owner_commands.receive(Duration::from_secs(2)).await.unwrap().unwrap();
        owner_commands.ack(&forwarded).await.unwrap();
        let forwarded = forwarded.message().unwrap();
        assert_eq!(forwarded.payload.as_ref().and_then(|p| p.get("command")), Some(&Payload::str("kill_job")));

        let outcome = command(&owner, forwarded.payload.unwrap()).await.unwrap();
        assert_eq!(outcome, CommandOutcome::JobKilled { job_uuid: "j1".to_string(), killed: true });
        assert_eq!(stats(&owner).await.jobs_killed, 1);

        let result_letter = job_message("node01", "s1", "j1", [("exit_value", Payload::Int(0))]);
        let outcome = deadletter(&other, result_letter, "ops/s1.j1.output").await;
        assert_eq!(outcome, DeadletterOutcome::Forwarded { host: "node01".to_string() });
        let forwarded = owner_commands.receive(Duration::from_secs(2)).await.unwrap().unwrap();
        let payload = forwarded.message().unwrap().payload.unwrap();
        assert_eq!(payload.get("command"), Some(&Payload::str("stop_session")));
        assert_eq!(payload.get("session_uuid"), Some(&Payload::str("s1")));

        owner.stop(None);
        other.stop(None);
    }

    #[tokio::test]
    async fn test_kill_job_of_unknown_job_kills_nothing() {
        let broker = InMemoryBroker::new("ops");
        let (daemon, _session) = start(&broker, 3).await;
        let kill = Payload::map([("command", Payload::str("kill_job")), ("job_uuid", Payload::str("ghost"))]);
        let outcome = command(&daemon, kill).await.unwrap();
        assert_eq!(outcome, CommandOutcome::JobKilled { job_uuid: "ghost".to_string(), killed: false });
        assert_eq!(stats(&daemon).await.jobs_killed, 0);
        daemon.stop(None);
    }

    #[tokio::test]
    async fn test_stopped_sessions_are_forgotten_after_retention() {
        let broker = InMemoryBroker::new("ops");
        let stop = || Payload::map([("command", Payload::str("stop_session")), ("session_uuid", Payload::str("s1"))]);

        let (kept, _session) = start(&broker, 3).await;
        command(&kept, stop()).await.unwrap();
        reconcile(&kept).await;
        assert!(matches!(command(&kept, stop()).await.unwrap(), CommandOutcome::AlreadyStopped { .. }));
        kept.stop(None);

        let mut config = test_config(3);
        config.daemon.retention_secs = 0;
        let (forgetful, _session) = start_with(&broker, "node02", &config).await;
        command(&forgetful, stop()).await.unwrap();
        reconcile(&forgetful).await;
        assert!(matches!(command(&forgetful, stop()).await.unwrap(), CommandOutcome::SessionStopped { killed: 0, .. }));
        assert!(command(&forgetful, run_job("s1", "j1", "true")).await.is_ok());
        forgetful.stop(None);
    }

    #[tokio::test]
    async fn test_non_job_deadletters_are_ignored() {
        let broker = InMemoryBroker::new("ops");
        let (daemon, _session) = start(&broker, 3).await;
        let outcome = deadletter(&daemon, Message::event(Payload::Int(1)), "reply.0000").await;
        assert_eq!(outcome, DeadletterOutcome::Ignored);
        daemon.stop(None);
    }

    #[test]
    fn test_job_argv_forms() {
        assert_eq!(job_argv(Some(&Payload::str("echo hi"))).unwrap(), vec!["sh", "-c", "echo hi"]);
        let list = Payload::list([Payload::str("run.py"), Payload::Int(3)]);
        assert_eq!(job_argv(Some(&list)).unwrap(), vec!["run.py", "3"]);
        assert!(job_argv(None).is_err());
        assert!(job_argv(Some(&Payload::list([]))).is_err());
    }
}

//! Receive loop of the command-queue daemon
//!
//! Watches `<host>.command` and the bus deadletter queue, hands every message
//! to the [`QueueDaemon`](super::daemon::QueueDaemon) actor and reconciles
//! subprocess state after each step. A message is acknowledged once the actor
//! has handled it, whatever the outcome, and also when the actor could not be asked.

use std::time::Duration;

use ractor::{
    ActorRef, RpcReplyPort,
    rpc::{CallResult, call}
};
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

use crate::{
    actor::message::{CommandOutcome, DaemonMessage, DeadletterOutcome},
    bus::{BusSession, FromBus},
    config::DispatchConfig,
    domain::{address::Address, constant::daemon, error::DispatchError},
    port::bus::ReceiverOptions
};

/// What one loop step did
#[derive(Debug)]
pub enum StepOutcome {
    /// Nothing arrived within the timeout
    Idle,
    /// The message could not be decoded and was dropped
    Malformed,
    Command(Result<CommandOutcome, DispatchError>),
    Deadletter(Result<DeadletterOutcome, DispatchError>)
}

pub struct DaemonRunner {
    session:      BusSession,
    daemon:       ActorRef<DaemonMessage>,
    receiver:     FromBus,
    command:      Address,
    deadletter:   Address,
    interval:     Duration,
    call_timeout: Duration
}

impl DaemonRunner {
    pub async fn new(
        session: &BusSession,
        daemon: ActorRef<DaemonMessage>,
        bus: &str,
        host: &str,
        interval: Duration
    ) -> Result<Self, DispatchError> {
        Self::build(session, daemon, bus, host, interval, ReceiverOptions::default()).await
    }

    /// Runner with the loop interval of the `daemon` section and the receiver options of the `bus` section
    pub async fn from_config(
        session: &BusSession,
        daemon: ActorRef<DaemonMessage>,
        bus: &str,
        host: &str,
        config: &DispatchConfig
    ) -> Result<Self, DispatchError> {
        Self::build(session, daemon, bus, host, config.daemon.loop_interval(), config.bus.receiver()).await
    }

    async fn build(
        session: &BusSession,
        daemon: ActorRef<DaemonMessage>,
        bus: &str,
        host: &str,
        interval: Duration,
        options: ReceiverOptions
    ) -> Result<Self, DispatchError> {
        let command = Address::command(bus, host);
        let deadletter = Address::deadletter(bus);
        let receiver = session.receiver(&[command.clone(), deadletter.clone()], options).await?;

        Ok(Self {
            session: session.clone(),
            daemon,
            receiver,
            command,
            deadletter,
            interval,
            call_timeout: Duration::from_secs(30)
        })
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn command_address(&self) -> &Address {
        &self.command
    }

    /// Receive and handle at most one message, then reconcile job state
    pub async fn step(&self, timeout: Duration) -> Result<StepOutcome, DispatchError> {
        let Some(delivery) = self.receiver.receive(timeout).await? else {
            self.process_state().await?;
            return Ok(StepOutcome::Idle);
        };

        let message = match delivery.message() {
            Ok(message) => message,
            Err(e) => {
                event!(Level::WARN, event = daemon::MESSAGE_MALFORMED, address = %delivery.address, error = %e);
                self.receiver.ack(&delivery).await?;
                return Ok(StepOutcome::Malformed);
            }
        };

        let outcome = if delivery.address == self.deadletter {
            let origin = message.properties.deadletter_origin.clone();
            self.ask(|reply| DaemonMessage::ProcessDeadletter { message: Box::new(message), origin, reply })
                .await
                .map(StepOutcome::Deadletter)
        } else {
            let result = self.ask(|reply| DaemonMessage::ProcessCommand { message: Box::new(message), reply }).await;
            if let Ok(Err(e)) = &result {
                event!(Level::WARN, event = daemon::COMMAND_FAILED, address = %delivery.address, error = %e);
            }
            result.map(StepOutcome::Command)
        };

        // Settled even when the actor did not answer, so the subscription keeps yielding.
        self.receiver.ack(&delivery).await?;
        let outcome = outcome?;
        self.process_state().await?;
        Ok(outcome)
    }

    /// Step until `cancel` fires. Bus errors are logged and retried after the
    /// loop interval; a closed session ends the loop with an error.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), DispatchError> {
        event!(Level::INFO, event = daemon::DAEMON_STARTED, command = %self.command, deadletter = %self.deadletter);

        let result = loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                step = self.step(self.interval) => step
            };

            if let Err(e) = step {
                if !self.session.is_open() {
                    break Err(e);
                }
                event!(Level::ERROR, event = daemon::STEP_FAILED, error = %e);
                tokio::time::sleep(self.interval).await;
            }
        };

        self.receiver.close().await?;
        event!(Level::INFO, event = daemon::DAEMON_STOPPED, command = %self.command);
        result
    }

    async fn process_state(&self) -> Result<usize, DispatchError> {
        self.ask(|reply| DaemonMessage::ProcessState { reply }).await?
    }

    async fn ask<T, F>(&self, build: F) -> Result<T, DispatchError>
    where
        T: Send + 'static,
        F: FnOnce(RpcReplyPort<T>) -> DaemonMessage
    {
        match call(&self.daemon, build, Some(self.call_timeout)).await {
            Ok(CallResult::Success(value)) => Ok(value),
            Ok(CallResult::Timeout) => Err(DispatchError::timeout("daemon actor", self.call_timeout)),
            Ok(CallResult::SenderError) => Err(DispatchError::Rpc("daemon actor dropped the reply".to_string())),
            Err(e) => Err(DispatchError::Rpc(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        actor::daemon::{DaemonArgs, QueueDaemon},
        adapter::memory_bus::InMemoryBroker,
        domain::{
            address::JobChannel,
            message::{Message, MessageProperties},
            payload::Payload
        },
        port::bus::Envelope
    };

    fn test_config(max_repost: u32) -> DispatchConfig {
        let mut config = DispatchConfig::default();
        config.group.max_concurrent = 2;
        config.group.poll_interval_ms = 10;
        config.daemon.max_repost = max_repost;
        config.daemon.loop_interval_ms = 20;
        config
    }

    async fn runner_with(broker: &InMemoryBroker, config: &DispatchConfig) -> (DaemonRunner, BusSession) {
        let session = BusSession::open(broker, config.bus.connection()).await.unwrap();
        let args = DaemonArgs::from_config(session.clone(), "ops", "node01", config);
        let (daemon, _) = QueueDaemon::spawn(args).await.unwrap();
        let runner = DaemonRunner::from_config(&session, daemon, "ops", "node01", config).await.unwrap();
        (runner, session)
    }

    async fn runner(broker: &InMemoryBroker, max_repost: u32) -> (DaemonRunner, BusSession) {
        runner_with(broker, &test_config(max_repost)).await
    }

    fn run_job(command: &str) -> Message {
        Message::command(Payload::map([
            ("command", Payload::str("run_job")),
            ("session_uuid", Payload::str("s1")),
            ("job_uuid", Payload::str("j1")),
            ("job_command", Payload::str(command))
        ]))
    }

    #[tokio::test]
    async fn test_malformed_message_is_skipped() {
        let broker = InMemoryBroker::new("ops");
        let (runner, session) = runner(&broker, 3).await;
        let garbage = Envelope { body: b"not a message".to_vec(), properties: MessageProperties::default() };
        session.connection().send(runner.command_address(), garbage).await.unwrap();

        let outcome = runner.step(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Malformed));
        assert_eq!(broker.queue_depth(runner.command_address()), 0);
        assert!(matches!(runner.step(Duration::from_millis(20)).await.unwrap(), StepOutcome::Idle));
    }

    #[tokio::test]
    async fn test_unanswered_parameters_are_reposted_then_job_killed() {
        let broker = InMemoryBroker::new("ops");
        let mut config = test_config(1);
        config.daemon.message_ttl_ms = 100;
        let (runner, session) = runner_with(&broker, &config).await;
        session.sender(runner.command_address().clone()).send(&run_job("sleep 30")).await.unwrap();

        let started = runner.step(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(started, StepOutcome::Command(Ok(CommandOutcome::JobStarted { .. }))));
        // The parameters wait in their own queue until they expire.
        let parameters = Address::job_channel("ops", "s1", "j1", JobChannel::Parameters);
        assert_eq!(broker.queue_depth(&parameters), 1);
        assert_eq!(broker.queue_depth(&Address::deadletter("ops")), 0);

        let reposted = runner.step(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(reposted, StepOutcome::Deadletter(Ok(DeadletterOutcome::Reposted { attempt: 1 }))));

        let retired = runner.step(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(retired, StepOutcome::Deadletter(Ok(DeadletterOutcome::Retired { teardown: true }))));

        assert!(matches!(runner.step(Duration::from_millis(20)).await.unwrap(), StepOutcome::Idle));
        assert_eq!(broker.queue_depth(&Address::deadletter("ops")), 0);
    }

    #[tokio::test]
    async fn test_delivery_is_settled_when_the_daemon_does_not_answer() {
        let broker = InMemoryBroker::new("ops");
        let (runner, session) = runner(&broker, 3).await;
        let runner = runner.with_call_timeout(Duration::ZERO);
        let sender = session.sender(runner.command_address().clone());
        let stop = || {
            Message::command(Payload::map([
                ("command", Payload::str("stop_session")),
                ("session_uuid", Payload::str("s1"))
            ]))
        };

        sender.send(&stop()).await.unwrap();
        assert!(matches!(runner.step(Duration::from_secs(1)).await, Err(DispatchError::Timeout { .. })));
        assert_eq!(broker.in_flight_count(), 0);

        // The command subscription still yields the next message.
        sender.send(&stop()).await.unwrap();
        assert!(runner.step(Duration::from_secs(1)).await.is_err());
        assert_eq!(broker.queue_depth(runner.command_address()), 0);
        assert_eq!(broker.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_finished_job_publishes_exit_value_and_output() {
        let broker = InMemoryBroker::new("ops");
        let (runner, session) = runner(&broker, 3).await;
        let channels: Vec<Address> = [JobChannel::Parameters, JobChannel::ExitValue, JobChannel::Output]
            .into_iter()
            .map(|channel| Address::job_channel("ops", "s1", "j1", channel))
            .collect();
        let master = session.receiver(&channels, ReceiverOptions { capacity: 8, ephemeral: false }).await.unwrap();

        session.sender(runner.command_address().clone()).send(&run_job("echo hi; exit 4")).await.unwrap();
        let cancel = CancellationToken::new();
        let loop_handle = tokio::spawn(runner.run(cancel.clone()));

        let mut seen = Vec::new();
        while seen.len() < 3 {
            let delivery = master.receive(Duration::from_secs(5)).await.unwrap().expect("job channel message");
            master.ack(&delivery).await.unwrap();
            let payload = delivery.message().unwrap().payload.unwrap();
            seen.push((delivery.address.parse_job_channel().unwrap().2, payload));
        }
        cancel.cancel();
        loop_handle.await.unwrap().unwrap();

        let find = |channel: JobChannel| seen.iter().find(|(c, _)| *c == channel).map(|(_, p)| p.clone()).unwrap();
        assert_eq!(find(JobChannel::ExitValue).get("exit_value"), Some(&Payload::Int(4)));
        assert_eq!(find(JobChannel::Output).get("stdout").and_then(Payload::as_str), Some("hi\n"));
        assert_eq!(find(JobChannel::Parameters).get("job_uuid").and_then(Payload::as_str), Some("j1"));
    }
}

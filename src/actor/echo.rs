//! Broadcast-and-wait: ask a set of hosts to echo and collect who answered

use std::{collections::BTreeSet, time::Duration};

use serde::Serialize;
use tokio::time::Instant;
use tracing::{Level, event};

use crate::{
    bus::BusSession,
    domain::{address::Address, constant::daemon, error::DispatchError, message::Message, payload::Payload},
    port::bus::ReceiverOptions
};

/// Who answered an echo broadcast within the grace period
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EchoReport {
    pub replied:    BTreeSet<String>,
    /// Hosts that never replied
    pub stragglers: BTreeSet<String>
}

impl EchoReport {
    pub fn all_replied(&self) -> bool {
        self.stragglers.is_empty()
    }
}

/// Send an `echo` command to every host's command queue and wait up to
/// `grace` for their replies. Missing hosts are reported, not an error.
pub async fn broadcast_echo(
    session: &BusSession,
    bus: &str,
    hosts: &[String],
    grace: Duration
) -> Result<EchoReport, DispatchError> {
    let return_subject = Address::reply();
    let mut receiver = session.receiver(&[return_subject.clone()], ReceiverOptions::ephemeral()).await?;

    let command = Message::command(Payload::map([
        ("command", Payload::str("echo")),
        ("type", Payload::str("command")),
        ("echo_type", Payload::str("slave_echo")),
        ("return_subject", Payload::str(return_subject.to_string()))
    ]));
    for host in hosts {
        session.sender(Address::command(bus, host)).send(&command).await?;
    }
    event!(Level::INFO, event = daemon::ECHO_SENT, hosts = hosts.len(), return_subject = %return_subject);

    let mut stragglers: BTreeSet<String> = hosts.iter().cloned().collect();
    let mut replied = BTreeSet::new();
    let deadline = Instant::now() + grace;

    while !stragglers.is_empty() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let Some(delivery) = receiver.receive(remaining).await? else {
            break;
        };
        receiver.ack(&delivery).await?;

        let host = match delivery.message() {
            Ok(message) => message.payload.as_ref().and_then(|p| p.get("host")).and_then(Payload::as_str).map(String::from),
            Err(e) => {
                event!(Level::WARN, event = daemon::MESSAGE_MALFORMED, address = %delivery.address, error = %e);
                continue;
            }
        };
        match host {
            Some(host) => {
                stragglers.remove(&host);
                replied.insert(host);
            }
            None => event!(Level::WARN, event = daemon::MESSAGE_MALFORMED, address = %delivery.address,
                           message = "echo reply without host")
        }
    }
    receiver.close().await?;

    if !stragglers.is_empty() {
        event!(Level::WARN, event = daemon::ECHO_STRAGGLERS, stragglers = ?stragglers);
    }
    Ok(EchoReport { replied, stragglers })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ractor::ActorRef;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        actor::{
            daemon::{DaemonArgs, QueueDaemon},
            message::DaemonMessage,
            runner::DaemonRunner
        },
        adapter::memory_bus::InMemoryBroker,
        group::{GroupOptions, SubprocessGroup},
        port::bus::{ConnectionOptions, Envelope}
    };

    async fn host_daemon(session: &BusSession, host: &str) -> (ActorRef<DaemonMessage>, DaemonRunner) {
        let group = Arc::new(SubprocessGroup::new(GroupOptions::default()));
        let args = DaemonArgs {
            session: session.clone(),
            bus: "ops".to_string(),
            host: host.to_string(),
            max_repost: 3,
            message_ttl: Duration::from_secs(60),
            retention: Duration::from_secs(3_600),
            group
        };
        let (daemon, _) = QueueDaemon::spawn(args).await.unwrap();
        let runner = DaemonRunner::new(session, daemon.clone(), "ops", host, Duration::from_millis(20)).await.unwrap();
        (daemon, runner)
    }

    #[tokio::test]
    async fn test_stragglers_are_reported() {
        let broker = InMemoryBroker::new("ops");
        let session = BusSession::open(&broker, ConnectionOptions::default()).await.unwrap();
        let cancel = CancellationToken::new();

        let (daemon, runner) = host_daemon(&session, "node01").await;
        let handle = tokio::spawn(runner.run(cancel.clone()));
        // node02 has a command queue but nobody serving it
        let _idle = session.receiver(&[Address::command("ops", "node02")], ReceiverOptions::default()).await.unwrap();

        let hosts = vec!["node01".to_string(), "node02".to_string()];
        let report = broadcast_echo(&session, "ops", &hosts, Duration::from_millis(500)).await.unwrap();

        assert_eq!(report.replied, BTreeSet::from(["node01".to_string()]));
        assert_eq!(report.stragglers, BTreeSet::from(["node02".to_string()]));
        assert!(!report.all_replied());

        cancel.cancel();
        handle.await.unwrap().unwrap();
        daemon.stop(None);
    }

    #[tokio::test]
    async fn test_malformed_reply_is_skipped() {
        let broker = InMemoryBroker::new("ops");
        let session = BusSession::open(&broker, ConnectionOptions::default()).await.unwrap();
        let mut queue = session.receiver(&[Address::command("ops", "node03")], ReceiverOptions::default()).await.unwrap();

        // Answer by hand: garbage first, then a proper reply
        let responder = session.clone();
        let answer = tokio::spawn(async move {
            let delivery = queue.receive(Duration::from_secs(2)).await.unwrap().unwrap();
            queue.ack(&delivery).await.unwrap();
            let payload = delivery.message().unwrap().payload.unwrap();
            let subject: Address = payload.require_str("return_subject").unwrap().parse().unwrap();

            let garbage = Envelope { body: b"{".to_vec(), properties: Default::default() };
            responder.connection().send(&subject, garbage).await.unwrap();
            let reply = Message::event(Payload::map([("host", Payload::str("node03"))]));
            responder.sender(subject).send(&reply).await.unwrap();
            queue.close().await.unwrap();
        });

        let report = broadcast_echo(&session, "ops", &["node03".to_string()], Duration::from_secs(2)).await.unwrap();
        answer.await.unwrap();
        assert!(report.all_replied());
    }
}

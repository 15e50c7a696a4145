//! Bus addressing
//!
//! Named destinations are written `<bus>/<name>`. Every per-job destination
//! is a pure function of (bus, session id, job id, channel) so any participant
//! can rebuild it without a directory lookup.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::error::DispatchError;

/// Reserved prefix of ephemeral per-call reply destinations
pub const REPLY_PREFIX: &str = "reply.";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub bus:  Option<String>,
    pub name: String
}

impl Address {
    pub fn new(bus: impl Into<String>, name: impl Into<String>) -> Self {
        Self { bus: Some(bus.into()), name: name.into() }
    }

    /// A fresh, never reused `reply.<uuid>` destination
    pub fn reply() -> Self {
        Self { bus: None, name: format!("{}{}", REPLY_PREFIX, Uuid::new_v4()) }
    }

    pub fn is_reply(&self) -> bool {
        self.bus.is_none() && self.name.starts_with(REPLY_PREFIX)
    }

    pub fn job_channel(bus: &str, session_uuid: &str, job_uuid: &str, channel: JobChannel) -> Self {
        Self::new(bus, format!("{}.{}.{}", session_uuid, job_uuid, channel.as_str()))
    }

    /// Command queue of the daemon running on `host`
    pub fn command(bus: &str, host: &str) -> Self {
        Self::new(bus, format!("{}.command", host))
    }

    pub fn deadletter(bus: &str) -> Self {
        Self::new(bus, "deadletter")
    }

    /// Split a job-channel address back into (session, job, channel)
    pub fn parse_job_channel(&self) -> Option<(String, String, JobChannel)> {
        let (rest, channel) = self.name.rsplit_once('.')?;
        let channel = channel.parse().ok()?;
        let (session, job) = rest.rsplit_once('.')?;
        if session.is_empty() || job.is_empty() {
            return None;
        }
        Some((session.to_string(), job.to_string(), channel))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bus {
            Some(bus) => write!(f, "{}/{}", bus, self.name),
            None => f.write_str(&self.name)
        }
    }
}

impl FromStr for Address {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bus, name) = match s.split_once('/') {
            Some((bus, name)) => (Some(bus.to_string()), name.to_string()),
            None => (None, s.to_string())
        };

        if name.is_empty() || bus.as_deref() == Some("") {
            return Err(DispatchError::Validation(format!("invalid bus address '{}'", s)));
        }

        Ok(Self { bus, name })
    }
}

/// Per-job communication channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobChannel {
    Parameters,
    ExitValue,
    Output
}

impl JobChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobChannel::Parameters => "parameters",
            JobChannel::ExitValue => "exit_value",
            JobChannel::Output => "output"
        }
    }
}

impl fmt::Display for JobChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobChannel {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parameters" => Ok(JobChannel::Parameters),
            "exit_value" => Ok(JobChannel::ExitValue),
            "output" => Ok(JobChannel::Output),
            other => Err(DispatchError::Validation(format!("unknown job channel '{}'", other)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let address: Address = "lofar.ops/L12345.command".parse().unwrap();
        assert_eq!(address.bus.as_deref(), Some("lofar.ops"));
        assert_eq!(address.name, "L12345.command");
        assert_eq!(address.to_string(), "lofar.ops/L12345.command");

        assert!("/missing-bus".parse::<Address>().is_err());
        assert!("bus/".parse::<Address>().is_err());
    }

    #[test]
    fn test_reply_addresses_are_unique() {
        let a = Address::reply();
        let b = Address::reply();
        assert!(a.is_reply());
        assert!(a.to_string().starts_with(REPLY_PREFIX));
        assert_ne!(a, b);
    }

    #[test]
    fn test_job_channel_addresses_are_deterministic() {
        let a = Address::job_channel("ops", "s-1", "j-9", JobChannel::ExitValue);
        let b = Address::job_channel("ops", "s-1", "j-9", JobChannel::ExitValue);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "ops/s-1.j-9.exit_value");
        assert_eq!(a.parse_job_channel(), Some(("s-1".to_string(), "j-9".to_string(), JobChannel::ExitValue)));
        assert_eq!(Address::new("ops", "host.command").parse_job_channel(), None);
    }
}

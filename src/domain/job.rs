//! Remote job model and lifecycle

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::{
    error::DispatchError,
    payload::{Payload, PayloadMap}
};

/// Lifecycle of a job owned by the dispatcher
///
/// `Created → Dispatched → Fetched → Complete`, with `Failed` reachable from
/// any non-terminal phase. Results are only accepted once the arguments were fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Created,
    Dispatched,
    Fetched,
    Complete,
    Failed(String)
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed(_))
    }

    fn can_become(&self, next: &JobStatus) -> bool {
        use JobStatus::*;

        match (self, next) {
            (Created, Dispatched) | (Created, Fetched) => true,
            (Dispatched, Fetched) => true,
            (Fetched, Complete) => true,
            (current, Failed(_)) => !current.is_terminal(),
            _ => false
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Created => f.write_str("created"),
            JobStatus::Dispatched => f.write_str("dispatched"),
            JobStatus::Fetched => f.write_str("fetched"),
            JobStatus::Complete => f.write_str("complete"),
            JobStatus::Failed(reason) => write!(f, "failed: {}", reason)
        }
    }
}

/// A unit of remote work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id:      String,
    pub host:        String,
    pub command:     String,
    #[serde(default)]
    pub arguments:   Vec<Payload>,
    #[serde(default)]
    pub results:     Option<PayloadMap>,
    #[serde(default)]
    pub return_code: Option<i32>,
    #[serde(skip, default = "initial_status")]
    pub status:      JobStatus
}

fn initial_status() -> JobStatus {
    JobStatus::Created
}

impl Job {
    pub fn new(job_id: impl Into<String>, host: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            job_id:      job_id.into(),
            host:        host.into(),
            command:     command.into(),
            arguments:   Vec::new(),
            results:     None,
            return_code: None,
            status:      JobStatus::Created
        }
    }

    pub fn with_arguments(mut self, arguments: Vec<Payload>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn transition(&mut self, next: JobStatus) -> Result<(), DispatchError> {
        if !self.status.can_become(&next) {
            return Err(DispatchError::Validation(format!(
                "job {} cannot move from {} to {}",
                self.job_id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Record results; the return code is read from a `returncode` entry if present
    pub fn complete(&mut self, results: PayloadMap) -> Result<(), DispatchError> {
        if matches!(self.status, JobStatus::Created | JobStatus::Dispatched) {
            return Err(DispatchError::Protocol(format!(
                "results for job {} arrived before its arguments were fetched",
                self.job_id
            )));
        }
        self.transition(JobStatus::Complete)?;
        // Out-of-range codes saturate so they still read as failures.
        self.return_code = results
            .get("returncode")
            .and_then(Payload::as_i64)
            .map(|code| i32::try_from(code).unwrap_or(if code < 0 { i32::MIN } else { i32::MAX }));
        self.results = Some(results);
        Ok(())
    }

    /// A job succeeded when it completed and did not report a non-zero return code
    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Complete && self.return_code.unwrap_or(0) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_happy_path() {
        let mut job = Job::new("J1", "node01", "run.sh");
        job.transition(JobStatus::Dispatched).unwrap();
        job.transition(JobStatus::Fetched).unwrap();
        job.complete(PayloadMap::from([("ok".to_string(), Payload::Bool(true))])).unwrap();

        assert!(job.succeeded());
        assert_eq!(job.return_code, None);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut job = Job::new("J2", "node01", "run.sh");
        job.transition(JobStatus::Failed("no route".into())).unwrap();
        assert!(job.transition(JobStatus::Fetched).is_err());
        assert!(job.complete(PayloadMap::new()).is_err());
        assert!(!job.succeeded());
    }

    fn fetched(job_id: &str) -> Job {
        let mut job = Job::new(job_id, "node02", "run.sh");
        job.transition(JobStatus::Fetched).unwrap();
        job
    }

    #[test]
    fn test_nonzero_returncode_is_not_success() {
        let mut job = fetched("J3");
        job.complete(PayloadMap::from([("returncode".to_string(), Payload::Int(2))])).unwrap();
        assert_eq!(job.return_code, Some(2));
        assert!(!job.succeeded());
    }

    #[test]
    fn test_results_before_fetch_are_refused() {
        let mut job = Job::new("J4", "node01", "run.sh");
        assert!(matches!(job.complete(PayloadMap::new()), Err(DispatchError::Protocol(_))));
        job.transition(JobStatus::Dispatched).unwrap();
        assert!(matches!(job.complete(PayloadMap::new()), Err(DispatchError::Protocol(_))));
        assert_eq!(job.status, JobStatus::Dispatched);
    }

    #[test]
    fn test_out_of_range_returncode_stays_a_failure() {
        for code in [1_i64 << 32, i64::MAX, i64::MIN] {
            let mut job = fetched("J5");
            job.complete(PayloadMap::from([("returncode".to_string(), Payload::Int(code))])).unwrap();
            assert_ne!(job.return_code, Some(0));
            assert!(!job.succeeded());
        }
    }
}

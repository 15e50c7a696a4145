//! Session-aware wrapper around the subprocess group

use std::{path::PathBuf, sync::Arc};

use crate::{
    domain::error::DispatchError,
    group::{Completion, SubprocessGroup},
    port::process::ProcessSpec
};

pub const SESSION_LABEL: &str = "session_uuid";
pub const JOB_LABEL: &str = "job_uuid";

/// A finished job with the ids it was started under
#[derive(Debug, Clone)]
pub struct JobCompletion {
    pub session_uuid: String,
    pub job_uuid:     String,
    pub completion:   Completion
}

pub struct JobManager {
    group: Arc<SubprocessGroup>
}

impl JobManager {
    pub fn new(group: Arc<SubprocessGroup>) -> Self {
        Self { group }
    }

    /// Start a job now, or queue it when every slot is busy
    pub fn start(&self, session_uuid: &str, job_uuid: &str, argv: Vec<String>, working_dir: Option<PathBuf>) {
        let mut spec = ProcessSpec::new(argv)
            .with_id(job_uuid)
            .with_label(SESSION_LABEL, session_uuid)
            .with_label(JOB_LABEL, job_uuid)
            .with_env("SESSION_UUID", session_uuid)
            .with_env("JOB_UUID", job_uuid);
        spec.working_dir = working_dir;
        self.group.submit(spec);
    }

    pub fn kill_job(&self, job_uuid: &str) -> Result<usize, DispatchError> {
        self.group.kill_where(|spec| spec.label(JOB_LABEL) == Some(job_uuid))
    }

    pub fn kill_session(&self, session_uuid: &str) -> Result<usize, DispatchError> {
        self.group.kill_where(|spec| spec.label(SESSION_LABEL) == Some(session_uuid))
    }

    /// One polling pass over the group
    pub async fn reconcile(&self) -> Vec<JobCompletion> {
        self.group
            .poll()
            .await
            .into_iter()
            .map(|completion| JobCompletion {
                session_uuid: completion.spec.label(SESSION_LABEL).unwrap_or_default().to_string(),
                job_uuid: completion.spec.label(JOB_LABEL).unwrap_or(&completion.spec.id).to_string(),
                completion
            })
            .collect()
    }

    pub fn running(&self) -> Vec<String> {
        self.group.active_ids()
    }

    pub fn queued(&self) -> usize {
        self.group.waiting_count()
    }
}

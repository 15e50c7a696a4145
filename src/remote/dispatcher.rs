//! Dispatcher side: register jobs, launch their workers, collect results

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tracing::{Level, event};

use crate::{
    domain::{
        constant::remote,
        error::DispatchError,
        job::{Job, JobStatus}
    },
    group::{GroupReport, SubprocessGroup},
    port::process::ProcessSpec,
    remote::{RemoteOptions, registry::JobRegistry, server::JobServer}
};

/// Hosts that run workers directly instead of through `ssh`
const LOCAL_HOSTS: [&str; 3] = ["", "localhost", "127.0.0.1"];

/// Outcome of every job of one dispatch
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub jobs:  Vec<Job>,
    pub group: GroupReport
}

impl DispatchReport {
    pub fn succeeded(&self) -> usize {
        self.jobs.iter().filter(|job| job.succeeded()).count()
    }

    pub fn failed(&self) -> Vec<&Job> {
        self.jobs.iter().filter(|job| !job.succeeded()).collect()
    }

    /// Per-job success flags in dispatch order, for data map bookkeeping
    pub fn outcomes(&self) -> Vec<bool> {
        self.jobs.iter().map(Job::succeeded).collect()
    }

    pub fn summary(&self) -> String {
        format!("{} of {} succeeded", self.succeeded(), self.jobs.len())
    }
}

pub struct JobDispatcher {
    server:       JobServer,
    group:        Arc<SubprocessGroup>,
    /// Host name workers use to reach the job server
    advertise:    String,
    result_grace: Duration
}

impl JobDispatcher {
    /// Start a job server on `bind` and dispatch through `group`
    pub async fn start(
        bind: &str,
        advertise: impl Into<String>,
        options: &RemoteOptions,
        group: Arc<SubprocessGroup>
    ) -> Result<Self, DispatchError> {
        let server = JobServer::bind(bind, JobRegistry::new(), options).await?;
        Ok(Self { server, group, advertise: advertise.into(), result_grace: Duration::from_secs(5) })
    }

    /// How long to wait for results after every worker process ended
    pub fn with_result_grace(mut self, grace: Duration) -> Self {
        self.result_grace = grace;
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        self.server.registry()
    }

    pub fn port(&self) -> u16 {
        self.server.local_addr().port()
    }

    /// Worker command line for a job: `<command> <job_id> <server_host> <server_port>`
    pub fn worker_spec(&self, job: &Job) -> ProcessSpec {
        let command = format!("{} {} {} {}", job.command, job.job_id, self.advertise, self.port());
        let spec = if LOCAL_HOSTS.contains(&job.host.as_str()) {
            ProcessSpec::shell(command)
        } else {
            ProcessSpec::new(vec![
                "ssh".to_string(),
                "-n".to_string(),
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                job.host.clone(),
                command
            ])
        };
        spec.with_id(job.job_id.clone()).with_label("job_id", job.job_id.clone())
    }

    /// Register a job and launch its worker
    pub async fn dispatch(&self, job: Job) -> Result<(), DispatchError> {
        let spec = self.worker_spec(&job);
        let job_id = job.job_id.clone();

        self.registry().register(job).await?;
        self.group.submit(spec);
        self.registry().mark_dispatched(&job_id).await
    }

    /// Wait for every worker, then fail the jobs that never returned results
    pub async fn wait(&self) -> Result<DispatchReport, DispatchError> {
        let group = self.group.wait_for_finish().await;

        if !self.registry().wait_settled(self.result_grace).await {
            for job_id in self.registry().pending().await {
                let reason = match group.failures.iter().find(|failure| failure.id == job_id) {
                    Some(failure) => format!("worker exited with code {} without results", failure.exit_code),
                    None => "worker returned no results".to_string()
                };
                self.registry().fail(&job_id, reason).await?;
            }
        }

        let jobs = self.registry().jobs().await;
        for job in jobs.iter().filter(|job| matches!(job.status, JobStatus::Failed(_))) {
            event!(Level::WARN, event = remote::JOB_FAILED, job_id = %job.job_id, host = %job.host, status = %job.status);
        }
        Ok(DispatchReport { jobs, group })
    }

    pub async fn shutdown(self) {
        self.server.shutdown().await;
    }
}

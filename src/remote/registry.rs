//! Per-job argument and result bookkeeping on the dispatcher side

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::{Notify, RwLock};
use tracing::{Level, event};

use crate::domain::{
    constant::remote,
    error::DispatchError,
    job::{Job, JobStatus},
    payload::{Payload, PayloadMap}
};

#[derive(Default)]
struct Jobs {
    by_id: HashMap<String, Job>,
    order: Vec<String>
}

/// Jobs owned by one dispatching session
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs:    Arc<RwLock<Jobs>>,
    settled: Arc<Notify>
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, job: Job) -> Result<(), DispatchError> {
        let mut jobs = self.jobs.write().await;
        if jobs.by_id.contains_key(&job.job_id) {
            return Err(DispatchError::Validation(format!("job {} is already registered", job.job_id)));
        }

        event!(Level::DEBUG, event = remote::JOB_REGISTERED, job_id = %job.job_id, host = %job.host);
        jobs.order.push(job.job_id.clone());
        jobs.by_id.insert(job.job_id.clone(), job);
        Ok(())
    }

    pub async fn mark_dispatched(&self, job_id: &str) -> Result<(), DispatchError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.by_id.get_mut(job_id).ok_or_else(|| DispatchError::UnknownJob(job_id.to_string()))?;

        // The worker may already have fetched before the launch was recorded.
        if job.status == JobStatus::Created {
            job.transition(JobStatus::Dispatched)?;
            event!(Level::INFO, event = remote::JOB_DISPATCHED, job_id = %job_id, host = %job.host);
        }
        Ok(())
    }

    /// Serve a job's arguments.
    ///
    /// An id that was never registered fails with `UnknownJob`; fetching a job
    /// that was already fetched returns the same arguments again.
    pub async fn fetch(&self, job_id: &str) -> Result<Vec<Payload>, DispatchError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.by_id.get_mut(job_id).ok_or_else(|| DispatchError::UnknownJob(job_id.to_string()))?;

        match job.status.clone() {
            JobStatus::Created | JobStatus::Dispatched => {
                job.transition(JobStatus::Fetched)?;
                event!(Level::INFO, event = remote::JOB_FETCHED, job_id = %job_id, arguments = job.arguments.len());
            }
            JobStatus::Fetched | JobStatus::Complete => {
                event!(Level::DEBUG, event = remote::JOB_FETCHED, job_id = %job_id, refetch = true);
            }
            JobStatus::Failed(reason) => {
                return Err(DispatchError::Execution(format!("job {} already failed: {}", job_id, reason)));
            }
        }
        Ok(job.arguments.clone())
    }

    /// Record a job's results. Only the first result counts; a resend returns `Ok(false)`.
    /// Results for a job whose arguments were never fetched are a `Protocol` error.
    pub async fn complete(&self, job_id: &str, results: PayloadMap) -> Result<bool, DispatchError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.by_id.get_mut(job_id).ok_or_else(|| DispatchError::UnknownJob(job_id.to_string()))?;

        if job.status.is_terminal() {
            event!(Level::DEBUG, event = remote::RESULT_DUPLICATE, job_id = %job_id, status = %job.status);
            return Ok(false);
        }

        job.complete(results)?;
        event!(Level::INFO, event = remote::JOB_COMPLETED, job_id = %job_id, return_code = ?job.return_code);
        drop(jobs);
        self.settled.notify_waiters();
        Ok(true)
    }

    /// Mark a job failed unless it already settled
    pub async fn fail(&self, job_id: &str, reason: impl Into<String>) -> Result<(), DispatchError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.by_id.get_mut(job_id).ok_or_else(|| DispatchError::UnknownJob(job_id.to_string()))?;

        if !job.status.is_terminal() {
            let reason = reason.into();
            event!(Level::WARN, event = remote::JOB_FAILED, job_id = %job_id, reason = %reason);
            job.transition(JobStatus::Failed(reason))?;
            drop(jobs);
            self.settled.notify_waiters();
        }
        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.read().await.by_id.get(job_id).cloned()
    }

    /// All jobs in registration order
    pub async fn jobs(&self) -> Vec<Job> {
        let jobs = self.jobs.read().await;
        jobs.order.iter().filter_map(|id| jobs.by_id.get(id).cloned()).collect()
    }

    pub async fn pending(&self) -> Vec<String> {
        let jobs = self.jobs.read().await;
        jobs.order.iter().filter(|id| jobs.by_id.get(*id).is_some_and(|job| !job.status.is_terminal())).cloned().collect()
    }

    /// Wait until every job settled or `timeout` passed; returns whether all settled
    pub async fn wait_settled(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending().await.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pending().await.is_empty();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(ok: bool) -> PayloadMap {
        PayloadMap::from([("ok".to_string(), Payload::Bool(ok))])
    }

    #[tokio::test]
    async fn test_unknown_id_differs_from_refetch() {
        let registry = JobRegistry::new();
        assert!(matches!(registry.fetch("J1").await, Err(DispatchError::UnknownJob(_))));

        registry.register(Job::new("J1", "localhost", "run").with_arguments(vec![Payload::Int(4)])).await.unwrap();
        assert_eq!(registry.fetch("J1").await.unwrap(), vec![Payload::Int(4)]);
        assert_eq!(registry.fetch("J1").await.unwrap(), vec![Payload::Int(4)]);
        assert_eq!(registry.get("J1").await.unwrap().status, JobStatus::Fetched);
    }

    #[tokio::test]
    async fn test_first_result_wins() {
        let registry = JobRegistry::new();
        registry.register(Job::new("J1", "localhost", "run")).await.unwrap();
        registry.fetch("J1").await.unwrap();

        assert!(registry.complete("J1", results(true)).await.unwrap());
        assert!(!registry.complete("J1", results(false)).await.unwrap());
        assert_eq!(registry.get("J1").await.unwrap().results, Some(results(true)));
        assert!(matches!(registry.complete("J2", results(true)).await, Err(DispatchError::UnknownJob(_))));
    }

    #[tokio::test]
    async fn test_failed_job_refuses_fetch_and_late_results() {
        let registry = JobRegistry::new();
        registry.register(Job::new("J1", "node01", "run")).await.unwrap();
        registry.mark_dispatched("J1").await.unwrap();
        registry.fail("J1", "connection refused").await.unwrap();

        assert!(matches!(registry.fetch("J1").await, Err(DispatchError::Execution(_))));
        assert!(!registry.complete("J1", results(true)).await.unwrap());
        assert!(registry.register(Job::new("J1", "node01", "run")).await.is_err());
    }

    #[tokio::test]
    async fn test_results_before_fetch_are_refused() {
        let registry = JobRegistry::new();
        registry.register(Job::new("J1", "localhost", "run")).await.unwrap();
        assert!(matches!(registry.complete("J1", results(true)).await, Err(DispatchError::Protocol(_))));

        registry.mark_dispatched("J1").await.unwrap();
        assert!(matches!(registry.complete("J1", results(true)).await, Err(DispatchError::Protocol(_))));
        assert_eq!(registry.get("J1").await.unwrap().status, JobStatus::Dispatched);
        assert_eq!(registry.pending().await, vec!["J1".to_string()]);

        registry.fetch("J1").await.unwrap();
        assert!(registry.complete("J1", results(true)).await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_settled() {
        let registry = JobRegistry::new();
        registry.register(Job::new("J1", "localhost", "run")).await.unwrap();
        assert!(!registry.wait_settled(Duration::from_millis(20)).await);
        registry.fetch("J1").await.unwrap();

        let other = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            other.complete("J1", results(true)).await.unwrap();
        });
        assert!(registry.wait_settled(Duration::from_secs(5)).await);
        assert_eq!(registry.jobs().await.len(), 1);
    }
}

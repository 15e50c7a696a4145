//! Bounded-concurrency subprocess group
//!
//! At most `max_concurrent` subprocesses run at once; further submissions wait
//! in a list. Completion is detected by polling: each pass checks every active
//! process without blocking, drains the finished ones and admits waiting
//! processes into the freed slots. No single failure aborts the group; every
//! non-zero exit is collected into the final [`GroupReport`].
//!
//! Admission is last-in first-out: the most recently queued process takes the
//! next free slot. Under contention, early submissions can therefore wait the
//! longest.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration
};

use serde::Serialize;
use tracing::{Level, event};

use crate::{
    adapter::process::TokioProcessLauncher,
    domain::{constant::group, error::DispatchError},
    port::process::{ProcessLauncher, ProcessOutput, ProcessSpec, RunningProcess}
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupOptions {
    pub max_concurrent: usize,
    pub poll_interval:  Duration
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self { max_concurrent: 8, poll_interval: Duration::from_secs(10) }
    }
}

/// A process the group has finished with
#[derive(Debug, Clone)]
pub struct Completion {
    pub spec:      ProcessSpec,
    pub exit_code: i32,
    /// Terminated through [`SubprocessGroup::kill_where`]
    pub killed:    bool,
    pub output:    ProcessOutput
}

impl Completion {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.killed
    }

    fn not_started(spec: ProcessSpec, reason: String, killed: bool) -> Self {
        Self { spec, exit_code: -1, killed, output: ProcessOutput { stdout: String::new(), stderr: reason } }
    }
}

/// One failed command of the group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub id:        String,
    pub command:   String,
    pub exit_code: i32
}

/// Final accounting of a group
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct GroupReport {
    pub total:     usize,
    pub succeeded: usize,
    pub failures:  Vec<Failure>
}

impl GroupReport {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn summary(&self) -> String {
        format!("{} of {} succeeded", self.succeeded, self.total)
    }
}

struct Active {
    spec:    ProcessSpec,
    process: Box<dyn RunningProcess>,
    killed:  bool
}

#[derive(Default)]
struct GroupState {
    active:      Vec<Active>,
    waiting:     Vec<ProcessSpec>,
    /// Completions known without polling (launch failures, killed while waiting)
    pending:     Vec<Completion>,
    report:      GroupReport,
    peak_active: usize
}

pub struct SubprocessGroup {
    launcher: Arc<dyn ProcessLauncher>,
    options:  GroupOptions,
    state:    Mutex<GroupState>
}

impl SubprocessGroup {
    pub fn new(options: GroupOptions) -> Self {
        Self::with_launcher(Arc::new(TokioProcessLauncher::new()), options)
    }

    pub fn with_launcher(launcher: Arc<dyn ProcessLauncher>, mut options: GroupOptions) -> Self {
        options.max_concurrent = options.max_concurrent.max(1);
        Self { launcher, options, state: Mutex::new(GroupState::default()) }
    }

    pub fn options(&self) -> &GroupOptions {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a shell command line
    pub fn run(&self, command: impl Into<String>, working_dir: Option<PathBuf>) -> String {
        let mut spec = ProcessSpec::shell(command);
        spec.working_dir = working_dir;
        self.submit(spec)
    }

    /// Enqueue a process; it starts now if a slot is free, otherwise it waits.
    /// Returns the process id.
    pub fn submit(&self, spec: ProcessSpec) -> String {
        let id = spec.id.clone();
        let mut state = self.lock();
        state.report.total += 1;

        if state.active.len() < self.options.max_concurrent {
            self.start(&mut state, spec);
        } else {
            event!(Level::DEBUG, event = group::PROCESS_QUEUED, id = %id, waiting = state.waiting.len() + 1);
            state.waiting.push(spec);
        }
        id
    }

    fn start(&self, state: &mut GroupState, spec: ProcessSpec) {
        match self.launcher.launch(&spec) {
            Ok(process) => {
                event!(Level::INFO, event = group::PROCESS_STARTED,
                       id = %spec.id, pid = ?process.pid(), command = %spec);
                state.active.push(Active { spec, process, killed: false });
                state.peak_active = state.peak_active.max(state.active.len());
            }
            Err(e) => {
                event!(Level::WARN, event = group::PROCESS_LAUNCH_FAILED, id = %spec.id, error = %e);
                state.pending.push(Completion::not_started(spec, e.to_string(), false));
            }
        }
    }

    /// One reconciliation pass: collect finished processes, then admit waiting ones
    pub async fn poll(&self) -> Vec<Completion> {
        let (mut completions, finished) = {
            let mut state = self.lock();
            let mut finished = Vec::new();
            let mut still_active = Vec::with_capacity(state.active.len());

            for mut active in state.active.drain(..) {
                match active.process.try_wait() {
                    Ok(None) => still_active.push(active),
                    Ok(Some(code)) => finished.push((active, code)),
                    Err(e) => {
                        event!(Level::WARN, event = group::PROCESS_FAILED, id = %active.spec.id, error = %e);
                        finished.push((active, -1));
                    }
                }
            }
            state.active = still_active;

            while state.active.len() < self.options.max_concurrent {
                let Some(spec) = state.waiting.pop() else {
                    break;
                };
                event!(Level::DEBUG, event = group::PROCESS_ADMITTED, id = %spec.id);
                self.start(&mut state, spec);
            }

            (std::mem::take(&mut state.pending), finished)
        };

        for (active, exit_code) in finished {
            let output = active.process.drain().await;
            completions.push(Completion { spec: active.spec, exit_code, killed: active.killed, output });
        }

        let mut state = self.lock();
        for completion in &completions {
            Self::record(&mut state.report, completion);
        }
        completions
    }

    fn record(report: &mut GroupReport, completion: &Completion) {
        if completion.succeeded() {
            event!(Level::INFO, event = group::PROCESS_FINISHED, id = %completion.spec.id);
            report.succeeded += 1;
            return;
        }

        if completion.killed {
            event!(Level::INFO, event = group::PROCESS_KILLED, id = %completion.spec.id);
        } else {
            event!(Level::WARN, event = group::PROCESS_FAILED,
                   id = %completion.spec.id, exit_code = completion.exit_code, command = %completion.spec);
        }
        report.failures.push(Failure {
            id:        completion.spec.id.clone(),
            command:   completion.spec.command_line(),
            exit_code: completion.exit_code
        });
    }

    /// Nothing running, waiting or left to report
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.active.is_empty() && state.waiting.is_empty() && state.pending.is_empty()
    }

    /// Poll every `poll_interval` until every submitted process has been reconciled
    pub async fn wait_for_finish(&self) -> GroupReport {
        loop {
            self.poll().await;
            if self.is_idle() {
                break;
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }

        let report = self.report();
        event!(Level::INFO, event = group::GROUP_FINISHED,
               total = report.total, succeeded = report.succeeded, failed = report.failures.len());
        report
    }

    /// Accounting of everything reconciled so far
    pub fn report(&self) -> GroupReport {
        self.lock().report.clone()
    }

    /// Kill active processes and drop waiting ones whose spec matches.
    /// Returns how many processes were affected.
    pub fn kill_where<P>(&self, predicate: P) -> Result<usize, DispatchError>
    where
        P: Fn(&ProcessSpec) -> bool
    {
        let mut state = self.lock();
        let mut affected = 0;

        for active in state.active.iter_mut().filter(|active| !active.killed && predicate(&active.spec)) {
            active.process.kill()?;
            active.killed = true;
            affected += 1;
        }

        let (dropped, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.waiting).into_iter().partition(&predicate);
        state.waiting = kept;
        affected += dropped.len();
        for spec in dropped {
            state.pending.push(Completion::not_started(spec, "killed before start".to_string(), true));
        }

        Ok(affected)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.lock().active.iter().map(|active| active.spec.id.clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.lock().waiting.len()
    }

    /// Highest number of simultaneously active processes seen
    pub fn peak_active(&self) -> usize {
        self.lock().peak_active
    }
}

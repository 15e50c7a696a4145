//! `tokio::process` implementation of the process ports

use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    task::JoinHandle,
    time::timeout
};

use crate::{
    domain::error::DispatchError,
    port::process::{ProcessLauncher, ProcessOutput, ProcessSpec, RunningProcess}
};

/// Launches local subprocesses with captured output
#[derive(Debug, Default, Clone)]
pub struct TokioProcessLauncher;

impl TokioProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessLauncher for TokioProcessLauncher {
    fn launch(&self, spec: &ProcessSpec) -> Result<Box<dyn RunningProcess>, DispatchError> {
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| DispatchError::Validation(format!("process {} has an empty command", spec.id)))?;

        let mut command = Command::new(program);
        command.args(args).envs(&spec.env).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        // Each child leads its own process group so a kill reaches everything it forked.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| DispatchError::Execution(format!("failed to start '{}': {}", spec.command_line(), e)))?;

        // Pipes are drained while the child runs so a chatty process never blocks on a full pipe.
        let stdout = child.stdout.take().map(capture);
        let stderr = child.stderr.take().map(capture);

        Ok(Box::new(TokioProcess { child, stdout, stderr, killed: false }))
    }
}

fn capture<R: AsyncRead + Unpin + Send + 'static>(mut reader: R) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Output still buffered in the pipes is collected for at most this long once a process was killed
const KILLED_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

struct TokioProcess {
    child:  Child,
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
    killed: bool
}

/// `SIGKILL` the process group led by `pid`
#[cfg(unix)]
fn kill_group(pid: u32) -> bool {
    unsafe { libc::kill(-(pid as i32), libc::SIGKILL) == 0 }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) -> bool {
    false
}

async fn collect(handle: Option<JoinHandle<String>>, bound: Option<Duration>) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match bound {
        None => (&mut handle).await.unwrap_or_default(),
        Some(bound) => match timeout(bound, &mut handle).await {
            Ok(joined) => joined.unwrap_or_default(),
            Err(_) => {
                handle.abort();
                String::new()
            }
        }
    }
}

#[async_trait]
impl RunningProcess for TokioProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> Result<Option<i32>, DispatchError> {
        let status = self.child.try_wait().map_err(|e| DispatchError::Execution(e.to_string()))?;
        Ok(status.map(|status| status.code().unwrap_or(-1)))
    }

    fn kill(&mut self) -> Result<(), DispatchError> {
        self.killed = true;
        if self.child.id().is_some_and(kill_group) {
            return Ok(());
        }
        self.child.start_kill().map_err(|e| DispatchError::Execution(e.to_string()))
    }

    async fn drain(self: Box<Self>) -> ProcessOutput {
        let TokioProcess { stdout, stderr, killed, .. } = *self;
        let bound = killed.then_some(KILLED_DRAIN_TIMEOUT);
        let (stdout, stderr) = tokio::join!(collect(stdout, bound), collect(stderr, bound));
        ProcessOutput { stdout, stderr }
    }
}

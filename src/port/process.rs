use std::{collections::BTreeMap, fmt, path::PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::error::DispatchError;

/// How to start one subprocess
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Identifier unique within a group
    pub id:          String,
    /// Program followed by its arguments
    pub argv:        Vec<String>,
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env:         BTreeMap<String, String>,
    /// Free-form tags, e.g. the session a job belongs to
    #[serde(default)]
    pub labels:      BTreeMap<String, String>
}

impl ProcessSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            argv,
            working_dir: None,
            env: BTreeMap::new(),
            labels: BTreeMap::new()
        }
    }

    /// Run a command line through `sh -c`
    pub fn shell(command: impl Into<String>) -> Self {
        Self::new(vec!["sh".to_string(), "-c".to_string(), command.into()])
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Human-readable command line
    pub fn command_line(&self) -> String {
        match self.argv.as_slice() {
            [sh, flag, command] if sh == "sh" && flag == "-c" => command.clone(),
            argv => argv.join(" ")
        }
    }
}

impl fmt::Display for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Captured output of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String
}

/// A launched subprocess
#[async_trait]
pub trait RunningProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking completion check; `Some(exit_code)` once the process ended
    fn try_wait(&mut self) -> Result<Option<i32>, DispatchError>;

    /// Ask the process to terminate
    fn kill(&mut self) -> Result<(), DispatchError>;

    /// Collect captured output after the process ended
    async fn drain(self: Box<Self>) -> ProcessOutput;
}

/// Starts subprocesses
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &ProcessSpec) -> Result<Box<dyn RunningProcess>, DispatchError>;
}

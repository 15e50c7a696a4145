//! # Dispatch CLI
//!
//! ```bash
//! # Run shell commands, at most `group.max_concurrent` at a time
//! dispatch run commands.txt
//!
//! # Serve a batch of remote jobs and wait for their results
//! dispatch serve jobs.yaml
//!
//! # Worker side; a job's command is `dispatch worker --exec <program>` and
//! # `serve` appends `<job_id> <host> <port>`
//! dispatch worker --exec ./process_subband.sh --exec-arg=-v J1 master01 40123
//! ```

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration
};

use clap::{Parser, Subcommand};
use dispatch::{
    adapter::TokioProcessLauncher,
    config::{DispatchConfig, load_config},
    domain::{
        error::DispatchError,
        job::Job,
        payload::{Payload, PayloadMap}
    },
    group::SubprocessGroup,
    logging::init_logging,
    port::process::{ProcessLauncher, ProcessSpec},
    remote::{DispatchReport, JobDispatcher, LogReceiver, RemoteWorker}
};
use tabled::{Table, Tabled, settings::Style};

#[derive(Parser)]
#[command(name = "dispatch", version, about = "Dispatch jobs to local and remote workers")]
struct DispatchCli {
    /// Config file, defaults to the platform config directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: DispatchCommand
}

#[derive(Subcommand)]
enum DispatchCommand {
    /// Run one shell command per line of a file
    Run { file: PathBuf },
    /// Serve a YAML list of jobs to their workers and report the results
    Serve {
        jobs: PathBuf,
        /// Address the job server binds to
        #[arg(long, default_value = "0.0.0.0:0")]
        bind: String,
        /// Also receive forwarded worker logs on this address
        #[arg(long)]
        log_sink: Option<String>
    },
    /// Fetch arguments for a job, run an executable with them and return the results
    Worker {
        /// Program run with the fetched arguments appended
        #[arg(long = "exec")]
        exec: String,
        /// Leading argument passed to the program before the fetched ones, repeatable
        #[arg(long = "exec-arg", allow_hyphen_values = true)]
        exec_args: Vec<String>,
        #[arg(long)]
        log_sink: Option<SocketAddr>,
        job_id: String,
        host: String,
        port: u16
    }
}

#[derive(Tabled)]
struct JobRow {
    #[tabled(rename = "Job")]
    job_id:      String,
    #[tabled(rename = "Host")]
    host:        String,
    #[tabled(rename = "Status")]
    status:      String,
    #[tabled(rename = "Return Code")]
    return_code: String
}

impl From<&Job> for JobRow {
    fn from(job: &Job) -> Self {
        Self {
            job_id:      job.job_id.clone(),
            host:        job.host.clone(),
            status:      job.status.to_string(),
            return_code: job.return_code.map(|code| code.to_string()).unwrap_or_else(|| "-".to_string())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), DispatchError> {
    let cli = DispatchCli::parse();
    init_logging(&cli.log_level)?;
    let config = load_config(cli.config.as_deref())?;

    let succeeded = match cli.command {
        DispatchCommand::Run { file } => run_commands(&file, &config).await?,
        DispatchCommand::Serve { jobs, bind, log_sink } => serve_jobs(&jobs, &bind, log_sink.as_deref(), &config).await?,
        DispatchCommand::Worker { exec, exec_args, log_sink, job_id, host, port } => {
            let executable = std::iter::once(exec).chain(exec_args).collect();
            let mut worker = RemoteWorker::new(job_id, &host, port, config.remote.options());
            if let Some(sink) = log_sink {
                worker = worker.with_log_sink(sink);
            }
            let results = worker.run(|arguments| execute(executable, arguments)).await?;
            results.get("returncode").and_then(Payload::as_i64) == Some(0)
        }
    };

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_commands(file: &Path, config: &DispatchConfig) -> Result<bool, DispatchError> {
    let content = std::fs::read_to_string(file)?;
    let group = SubprocessGroup::new(config.group.options());
    for line in content.lines().map(str::trim).filter(|line| !line.is_empty() && !line.starts_with('#')) {
        group.run(line, None);
    }

    let report = group.wait_for_finish().await;
    for failure in &report.failures {
        eprintln!("{} exited with {}: {}", failure.id, failure.exit_code, failure.command);
    }
    println!("{}", report.summary());
    Ok(report.all_succeeded())
}

async fn serve_jobs(
    file: &Path,
    bind: &str,
    log_sink: Option<&str>,
    config: &DispatchConfig
) -> Result<bool, DispatchError> {
    let jobs: Vec<Job> = serde_yaml::from_str(&std::fs::read_to_string(file)?)?;
    let logs = match log_sink {
        Some(addr) => Some(LogReceiver::bind(addr).await?),
        None => None
    };

    let group = Arc::new(SubprocessGroup::new(config.group.options()));
    let dispatcher =
        JobDispatcher::start(bind, config.remote.advertise_host(), &config.remote.options(), group).await?;
    for job in jobs {
        dispatcher.dispatch(job).await?;
    }

    let report = dispatcher.wait().await;
    dispatcher.shutdown().await;
    if let Some(logs) = logs {
        logs.shutdown().await;
    }
    let report = report?;

    print_report(&report);
    Ok(report.failed().is_empty())
}

fn print_report(report: &DispatchReport) {
    let rows: Vec<JobRow> = report.jobs.iter().map(JobRow::from).collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{}", table);
    println!("{}", report.summary());
}

/// Run the worker executable with the fetched arguments appended
async fn execute(executable: Vec<String>, arguments: Vec<Payload>) -> Result<PayloadMap, DispatchError> {
    let argv = executable.into_iter().chain(arguments.iter().map(Payload::to_arg)).collect();
    let mut process = TokioProcessLauncher::new().launch(&ProcessSpec::new(argv))?;

    let returncode = loop {
        if let Some(code) = process.try_wait()? {
            break code;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    let output = process.drain().await;

    Ok(PayloadMap::from([
        ("returncode".to_string(), Payload::Int(returncode as i64)),
        ("stdout".to_string(), Payload::str(output.stdout)),
        ("stderr".to_string(), Payload::str(output.stderr))
    ]))
}

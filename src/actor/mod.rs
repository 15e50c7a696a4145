//! Command-queue daemon built on Ractor
//!
//! [`QueueDaemon`] owns every piece of daemon state; [`DaemonRunner`] is the
//! bus-facing loop that feeds it.

pub mod daemon;
pub mod echo;
pub mod job_manager;
pub mod message;
pub mod runner;

pub use daemon::{DaemonArgs, QueueDaemon};
pub use echo::{EchoReport, broadcast_echo};
pub use message::*;
pub use runner::{DaemonRunner, StepOutcome};

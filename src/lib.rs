//! # Dispatch
//!
//! Job-dispatch and messaging core for a cluster of worker hosts:
//! - a remote job protocol serving argument lists to workers over TCP and
//!   collecting their results
//! - bounded subprocess groups
//! - a bus session with request/reply RPC on top
//! - a command-queue daemon that runs jobs for a master and reposts or
//!   tears down on undeliverable results

pub mod actor;
pub mod adapter;
pub mod bus;
pub mod config;
pub mod domain;
pub mod group;
pub mod logging;
pub mod port;
pub mod remote;
pub mod rpc;

pub use config::{DispatchConfig, load_config};
pub use domain::error::DispatchError;

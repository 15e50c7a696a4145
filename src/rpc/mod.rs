//! Synchronous request/reply on top of the bus

pub mod args;
pub mod client;
pub mod exception;
pub mod service;

pub use args::CallArgs;
pub use client::{RpcClient, RpcOptions};
pub use exception::ExceptionRegistry;
pub use service::{RpcFault, RpcHandler, RpcService};

pub mod memory_bus;
pub mod process;

pub use memory_bus::InMemoryBroker;
pub use process::TokioProcessLauncher;

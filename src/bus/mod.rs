//! Bus session and its sender/receiver roles

pub mod receiver;
pub mod sender;
pub mod session;

pub use receiver::FromBus;
pub use sender::ToBus;
pub use session::BusSession;

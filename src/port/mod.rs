//! Ports the dispatch core talks through
//!
//! The bus and subprocess seams are traits so the same session, group and
//! daemon logic runs against a real broker or the in-memory one.

pub mod bus;
pub mod process;

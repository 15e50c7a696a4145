//! Core domain types shared by every component

pub mod address;
pub mod constant;
pub mod datamap;
pub mod error;
pub mod job;
pub mod message;
pub mod payload;

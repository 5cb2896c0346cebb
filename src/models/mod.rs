//! Data models for topics, wire messages, grants, and demo state.

pub mod demo;
pub mod grant;
pub mod message;
pub mod topic;

pub use demo::*;
pub use grant::*;
pub use message::*;
pub use topic::*;

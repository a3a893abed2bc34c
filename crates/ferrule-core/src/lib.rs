//! # ferrule-core
//!
//! Foundation types shared by every ferrule crate.
//!
//! - Branded ID newtypes ([`SessionId`], [`RuntimeId`])
//! - [`Payload`], the decoded application message handed to handlers
//! - `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;
pub mod payload;

pub use ids::{RuntimeId, SessionId};
pub use payload::Payload;

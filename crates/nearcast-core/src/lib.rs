//! Nearcast Core - Fundamental types and primitives
//!
//! This crate defines the types shared by every Nearcast component:
//! - Identifiers (PeerId, SessionHandle, ServiceId, AttemptId, PassId)
//! - Logical time (Timestamp)
//! - The tracked payload
//! - Transport-originated events
//! - The error taxonomy

pub mod id;
pub mod time;
pub mod payload;
pub mod event;
pub mod error;

pub use id::*;
pub use time::*;
pub use payload::*;
pub use event::*;
pub use error::*;

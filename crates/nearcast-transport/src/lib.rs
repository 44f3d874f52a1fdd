//! Nearcast Transport Layer - the core's external collaborators
//!
//! This crate provides:
//! - The `Transport` capability (advertise, browse, invite, send)
//! - Payload codecs (JSON)
//! - An in-process, scriptable transport for simulation and tests

pub mod codec;
pub mod memory;
pub mod transport;

pub use codec::*;
pub use memory::*;
pub use transport::*;

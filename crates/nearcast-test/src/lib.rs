//! Nearcast Test Harness - Multi-node simulation
//!
//! This crate provides:
//! - Lossy link simulation
//! - A synchronous mesh that routes node commands between nodes
//! - End-to-end scenarios and invariant checks

pub mod chaos;
pub mod simulator;
pub mod integration;

pub use chaos::*;
pub use simulator::*;
pub use integration::*;

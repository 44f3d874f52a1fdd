//! Nearcast Runtime - Node orchestration and event loop
//!
//! Every state change flows through one ordered stream:
//! 1. Transport callbacks, `track` calls and completions are queued
//! 2. The node consumes them one at a time
//! 3. Discovery updates the peer registry
//! 4. The negotiator drives invites through their lifecycle
//! 5. The broadcast coordinator fans the payload out to connected peers
//! 6. Work for the transport leaves as commands, news as notifications
//!
//! `Node` is synchronous and owns all state. `NodeDriver` runs it on tokio
//! against a `Transport`.

pub mod broadcast;
pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod logging;
pub mod negotiator;
pub mod node;
pub mod policy;
pub mod registry;

pub use broadcast::*;
pub use config::*;
pub use dispatcher::*;
pub use driver::*;
pub use logging::*;
pub use negotiator::*;
pub use node::*;
pub use policy::*;
pub use registry::*;

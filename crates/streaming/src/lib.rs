//! Control protocol and broker plumbing for shard coordination.
//!
//! This crate provides:
//! - The control message enum and its JSON wire codec
//! - The `Broker` trait the coordination layer consumes
//! - An in-process broker for tests and simulation
//! - Identity-bound control channels (send and listen)

pub mod broker;
pub mod codec;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod receiver;
pub mod sender;

pub use broker::{Broker, ConsumerTag, Subscription};
pub use error::{Result, StreamingError};
pub use memory::{MemoryBroker, MemoryConnection};
pub use protocol::ControlMessage;
pub use receiver::{ChannelKind, ControlHandler, Listener};
pub use sender::ControlChannel;

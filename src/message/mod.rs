//! This module exports a minimal message-passing API, which is encapsulated
//! by a `Communicator` trait. Implementors only need to write `send`,
//! `try_recv`, and `recv` operations for a given transport layer (a
//! pure-Rust TCP transport and an in-process channel transport are
//! included). The trait then provides default implementations for
//! broadcast, reduce, and reduce-all operations.
//!
//! Bytes sent between ranks by the runtime are [`frame::Frame`]s, encoded
//! with MessagePack.
//!

pub mod backoff;
pub mod channel;
pub mod comm;
pub mod frame;
pub mod tcp;
pub mod util;

pub use channel::{ChannelCommunicator, SingleProcess};
pub use comm::Communicator;
pub use frame::Frame;
pub use tcp::TcpCommunicator;

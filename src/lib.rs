//! Gridflow is a dependency-driven scheduler for iterative stencil
//! computations on a block-decomposed, rectilinear grid. Each block owned by
//! a process is wrapped in a task that alternates between running a user
//! kernel on its valid region and exchanging guard-zone ("ghost") data with
//! its neighbors, some of which live in the same process and some on remote
//! ranks. The transfers are derived once from the grid geometry, and tasks
//! fire as soon as the data for their next step has arrived, so that
//! communication overlaps computation without any global barrier between
//! steps.
//!
//! The usual flow is: describe the grid with a [`Partition`] and a
//! [`Periodicity`], build a [`TaskGraph`] for the local rank, and hand it to
//! a [`Runtime`] over a [`message::Communicator`].

pub mod connection;
pub mod error;
pub mod graph;
pub mod index_space;
pub mod mailbox;
pub mod message;
pub mod partition;
pub mod patch;
pub mod runtime;
pub mod task;

pub use connection::{ConnectionBuilder, LocalCopyDescriptor, RemoteCommDescriptor, SequenceTag};
pub use error::Error;
pub use graph::TaskGraph;
pub use index_space::{range2d, IndexSpace};
pub use partition::{Block, BlockId, ExchangeTags, Partition, Periodicity};
pub use patch::{FieldData, Patch};
pub use runtime::{RunReport, Runtime, RuntimeConfig};
pub use task::{BlockTask, Kernel, Task, TaskOptions, TaskState};

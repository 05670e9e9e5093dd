use std::error;
use std::fmt;
use std::io;

use crate::index_space::IndexSpace;
use crate::mailbox::MessageKey;
use crate::partition::BlockId;
use crate::task::TaskState;




/// A task that could not fire before the stall deadline, along with the
/// message keys it was still waiting on.
#[derive(Debug, Clone)]
pub struct StalledTask {
    pub block: BlockId,
    pub state: TaskState,
    pub missing: Vec<MessageKey>,
}




#[derive(Debug)]

/**
 * Error to represent an inconsistent task graph, a failed message exchange,
 * or a run that stopped making progress. None of these are recoverable by
 * the scheduler: a block's step sequence cannot be partially completed.
 */
pub enum Error {
    MissingPartner { block: BlockId, neighbor: BlockId, region: IndexSpace },
    BoxMismatch { source: IndexSpace, dest: IndexSpace },
    UnknownBlock(BlockId),
    ForeignBlock { block: BlockId, rank: usize, expected: usize },
    InvalidStepBudget(usize),
    InvalidPartition(String),
    DuplicateTask(BlockId),
    RegionOutOfBounds { region: IndexSpace, space: IndexSpace },
    MessageSize { key: MessageKey, expected: usize, actual: usize },
    MissingMessage(MessageKey),
    DuplicateMessage(MessageKey),
    Misrouted { key: MessageKey, rank: usize, expected: usize },
    TaskTerminated(BlockId),
    Stalled { rank: usize, tasks: Vec<StalledTask> },
    CompletionTimeout { rank: usize },
    Transport(String),
    Codec(String),
    ThreadPool(String),
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        use Error::*;

        match self {
            MissingPartner { block, neighbor, region } => write!(fmt,
                "block {} has no partner descriptor on block {} for region {}",
                block, neighbor, region),
            BoxMismatch { source, dest } => write!(fmt,
                "source region {} and destination region {} differ in size",
                source, dest),
            UnknownBlock(block) => write!(fmt, "block {} is not in the partition", block),
            ForeignBlock { block, rank, expected } => write!(fmt,
                "block {} is owned by rank {}, expected rank {}",
                block, rank, expected),
            InvalidStepBudget(steps) => write!(fmt, "invalid step budget {} (must be at least 1)", steps),
            InvalidPartition(reason) => write!(fmt, "invalid partition: {}", reason),
            DuplicateTask(block) => write!(fmt, "more than one task for block {}", block),
            RegionOutOfBounds { region, space } => write!(fmt,
                "region {} is not contained in {}",
                region, space),
            MessageSize { key, expected, actual } => write!(fmt,
                "message {} has {} bytes, expected {}",
                key, actual, expected),
            MissingMessage(key) => write!(fmt, "message {} was pulled but never arrived", key),
            DuplicateMessage(key) => write!(fmt, "message {} arrived while an earlier copy was unconsumed", key),
            Misrouted { key, rank, expected } => write!(fmt,
                "message {} for rank {} was delivered to rank {}",
                key, expected, rank),
            TaskTerminated(block) => write!(fmt, "task for block {} was executed after it terminated", block),
            Stalled { rank, tasks } => {
                write!(fmt, "rank {} stalled with {} unfinished task(s)", rank, tasks.len())?;
                for task in tasks {
                    write!(fmt, "\n  block {} in state {:?} is waiting on", task.block, task.state)?;
                    for key in &task.missing {
                        write!(fmt, " {}", key)?;
                    }
                }
                Ok(())
            }
            CompletionTimeout { rank } => write!(fmt, "rank {} timed out waiting for its peers to finish", rank),
            Transport(msg) => write!(fmt, "transport failure: {}", msg),
            Codec(msg) => write!(fmt, "could not encode or decode a frame: {}", msg),
            ThreadPool(msg) => write!(fmt, "could not start the worker pool: {}", msg),
            Io(e) => write!(fmt, "i/o error: {}", e),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

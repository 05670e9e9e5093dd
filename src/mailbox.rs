use core::fmt;
use std::collections::hash_map::{Entry, HashMap};
use serde::{Deserialize, Serialize};
use crate::connection::SequenceTag;
use crate::error::Error;
use crate::partition::BlockId;




/// Identifies which transfer a message belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    /// A same-rank copy: the position of the transfer in the source block's
    /// local send list, which equals the `partner_index` of the receiving
    /// descriptor.
    Local(usize),

    /// A cross-rank transfer.
    Remote(SequenceTag),
}




/**
 * The key under which a message waits in a rank's mailbox. The epoch is the
 * step at which the receiving task consumes the message. It keeps messages
 * for consecutive steps apart, since a sender may run one step ahead of its
 * receiver.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub source: BlockId,
    pub dest: BlockId,
    pub tag: Tag,
    pub epoch: usize,
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag {
            Tag::Local(slot) => write!(f, "({} -> {} local #{} epoch {})", self.source, self.dest, slot, self.epoch),
            Tag::Remote(tag) => write!(f, "({} -> {} remote #{} epoch {})", self.source, self.dest, tag.ordinal, self.epoch),
        }
    }
}




/// A packed guard-zone region in transit from one block to another.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: BlockId,
    pub dest: BlockId,
    pub dest_rank: usize,
    pub tag: Tag,
    pub epoch: usize,
    pub data: Vec<u8>,
}

impl Envelope {
    pub fn key(&self) -> MessageKey {
        MessageKey {
            source: self.source,
            dest: self.dest,
            tag: self.tag,
            epoch: self.epoch,
        }
    }
}




/**
 * Buffer of messages that have arrived on a rank but have not yet been
 * pulled by the receiving task. Each key holds at most one message, and each
 * message is taken out exactly once.
 */
#[derive(Debug, Default)]
pub struct Mailbox {
    entries: HashMap<MessageKey, Envelope>,
}




// ============================================================================
impl Mailbox {

    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Determine whether a message with the given key is waiting, without
    /// consuming it.
    pub fn contains(&self, key: &MessageKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Deliver a message. It is an error to deliver a message while an
    /// earlier one with the same key is still unconsumed.
    pub fn insert(&mut self, envelope: Envelope) -> Result<(), Error> {
        match self.entries.entry(envelope.key()) {
            Entry::Occupied(entry) => Err(Error::DuplicateMessage(*entry.key())),
            Entry::Vacant(none) => {
                none.insert(envelope);
                Ok(())
            }
        }
    }

    /// Remove and return the message with the given key.
    pub fn take(&mut self, key: &MessageKey) -> Result<Envelope, Error> {
        self.entries.remove(key).ok_or(Error::MissingMessage(*key))
    }

    /// Move the messages with the given keys (those that are present) into
    /// a new mailbox.
    pub fn extract(&mut self, keys: &[MessageKey]) -> Self {
        Self {
            entries: keys
                .iter()
                .filter_map(|key| self.entries.remove_entry(key))
                .collect()
        }
    }

    /// Move all messages from another mailbox into this one.
    pub fn absorb(&mut self, other: Self) -> Result<(), Error> {
        for (_, envelope) in other.entries {
            self.insert(envelope)?
        }
        Ok(())
    }

    pub fn keys(&self) -> impl Iterator<Item = &MessageKey> {
        self.entries.keys()
    }
}
